//! Coarse validation of the CMS-signed sender record.
//!
//! Senders attach a PKCS7/CMS `SignedData` blob whose content is a property
//! list describing their Apple ID contact details. The bridge runs in
//! "Everyone" mode, so validation is deliberately shallow: the envelope
//! must be well-formed, the signed content must be present, and the
//! embedded certificate chain must contain a certificate issued by the
//! Apple root. Signature arithmetic is not checked and the contact payload
//! is never used to filter senders.

use crate::utils::{BridgeError, BridgeResult};

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0: u8 = 0xA0;

/// 1.2.840.113549.1.7.2, pkcs7 signedData.
const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];

/// Issuer common name every Apple-issued sender record chains to.
const APPLE_ROOT_CN: &[u8] = b"Apple Root CA";

/// A validated sender record.
#[derive(Debug)]
pub struct SenderRecord {
    /// The signed content: a property list of the sender's contact record.
    pub contact_payload: Vec<u8>,
}

/// Parse and coarsely validate a CMS blob.
pub fn verify(data: &[u8]) -> BridgeResult<SenderRecord> {
    let mut outer = DerReader::new(data);
    let content_info = outer.read_expected(TAG_SEQUENCE, "ContentInfo")?;

    let mut info = DerReader::new(content_info);
    let content_type = info.read_expected(TAG_OID, "content type")?;
    if content_type != OID_SIGNED_DATA {
        return Err(BridgeError::SenderRecord(
            "envelope is not pkcs7 signedData".into(),
        ));
    }
    let wrapped = info.read_expected(TAG_CONTEXT_0, "signedData wrapper")?;

    let mut wrapper = DerReader::new(wrapped);
    let signed_data = wrapper.read_expected(TAG_SEQUENCE, "SignedData")?;
    let mut sd = DerReader::new(signed_data);
    sd.read_expected(TAG_INTEGER, "version")?;
    sd.read_expected(TAG_SET, "digest algorithms")?;
    let encap = sd.read_expected(TAG_SEQUENCE, "encapsulated content")?;

    let mut encap_reader = DerReader::new(encap);
    encap_reader.read_expected(TAG_OID, "content oid")?;
    if encap_reader.done() {
        return Err(BridgeError::SenderRecord("no signed content".into()));
    }
    let econtent = encap_reader.read_expected(TAG_CONTEXT_0, "eContent wrapper")?;
    let mut octets = DerReader::new(econtent);
    let payload = octets.read_expected(TAG_OCTET_STRING, "signed content")?;

    let mut apple_issued = false;
    while !sd.done() {
        let (tag, contents) = sd.read()?;
        if tag != TAG_CONTEXT_0 {
            continue;
        }
        let mut certs = DerReader::new(contents);
        while !certs.done() {
            let (cert_tag, cert) = certs.read()?;
            if cert_tag == TAG_SEQUENCE && matches!(issued_by_apple_root(cert), Ok(true)) {
                apple_issued = true;
            }
        }
    }
    if !apple_issued {
        return Err(BridgeError::SenderRecord(
            "certificate chain does not reach the Apple root".into(),
        ));
    }

    Ok(SenderRecord {
        contact_payload: payload.to_vec(),
    })
}

/// Whether a certificate's issuer names the Apple root. Walks far enough
/// into the TBSCertificate to find the issuer and substring-matches the
/// common name; malformed certificates simply do not match.
fn issued_by_apple_root(cert: &[u8]) -> BridgeResult<bool> {
    let mut reader = DerReader::new(cert);
    let tbs = reader.read_expected(TAG_SEQUENCE, "TBSCertificate")?;

    let mut fields = DerReader::new(tbs);
    let (tag, _) = fields.read()?;
    if tag == TAG_CONTEXT_0 {
        // Explicit version; the serial number follows.
        fields.read_expected(TAG_INTEGER, "serial")?;
    }
    fields.read_expected(TAG_SEQUENCE, "signature algorithm")?;
    let issuer = fields.read_expected(TAG_SEQUENCE, "issuer")?;
    Ok(contains(issuer, APPLE_ROOT_CN))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

struct DerReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        DerReader { bytes, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Read one TLV, returning its tag and contents.
    fn read(&mut self) -> BridgeResult<(u8, &'a [u8])> {
        if self.pos + 2 > self.bytes.len() {
            return Err(BridgeError::SenderRecord("truncated der element".into()));
        }
        let tag = self.bytes[self.pos];
        if tag & 0x1f == 0x1f {
            return Err(BridgeError::SenderRecord("multi-byte tags unsupported".into()));
        }
        self.pos += 1;

        let first = self.bytes[self.pos];
        self.pos += 1;
        let length = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 {
                return Err(BridgeError::SenderRecord(
                    "indefinite lengths unsupported".into(),
                ));
            }
            if count > 4 || self.pos + count > self.bytes.len() {
                return Err(BridgeError::SenderRecord("oversized der length".into()));
            }
            let mut value = 0usize;
            for _ in 0..count {
                value = (value << 8) | self.bytes[self.pos] as usize;
                self.pos += 1;
            }
            value
        };

        if self.pos + length > self.bytes.len() {
            return Err(BridgeError::SenderRecord("der element overruns input".into()));
        }
        let contents = &self.bytes[self.pos..self.pos + length];
        self.pos += length;
        Ok((tag, contents))
    }

    fn read_expected(&mut self, expected: u8, what: &str) -> BridgeResult<&'a [u8]> {
        let (tag, contents) = self.read()?;
        if tag != expected {
            return Err(BridgeError::SenderRecord(format!(
                "expected {what} (tag 0x{expected:02x}), found tag 0x{tag:02x}"
            )));
        }
        Ok(contents)
    }
}
