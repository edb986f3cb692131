//! Binary property-list codec and the typed AirDrop request/response
//! records that travel over it.
//!
//! The records declare their Apple wire keys with explicit renames; the
//! codec itself is generic over any serde type and enforces a hard 1 MiB
//! cap in both directions.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::utils::{BridgeError, BridgeResult};

/// Hard cap on encoded and decoded property-list buffers.
pub const PLIST_MAX_BYTES: usize = 1024 * 1024;

/// Decode an Apple binary (or XML) property list into a typed record.
pub fn decode_plist<T: DeserializeOwned>(bytes: &[u8]) -> BridgeResult<T> {
    if bytes.len() > PLIST_MAX_BYTES {
        return Err(BridgeError::Plist(format!(
            "input of {} bytes exceeds the {PLIST_MAX_BYTES} byte cap",
            bytes.len()
        )));
    }
    plist::from_bytes(bytes).map_err(|e| BridgeError::Plist(e.to_string()))
}

/// Encode a typed record as an Apple binary property list.
pub fn encode_plist<T: Serialize>(value: &T) -> BridgeResult<Vec<u8>> {
    let mut buf = Vec::new();
    plist::to_writer_binary(&mut buf, value).map_err(|e| BridgeError::Plist(e.to_string()))?;
    if buf.len() > PLIST_MAX_BYTES {
        return Err(BridgeError::Plist(format!(
            "output of {} bytes exceeds the {PLIST_MAX_BYTES} byte cap",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Body of `POST /Discover`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverRequest {
    #[serde(rename = "SenderRecordData")]
    pub sender_record_data: Option<plist::Data>,
}

/// Reply to `POST /Discover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    #[serde(rename = "ReceiverComputerName")]
    pub receiver_computer_name: String,
    #[serde(rename = "ReceiverModelName")]
    pub receiver_model_name: String,
    /// UTF-8 JSON, `{"Version":1}`.
    #[serde(rename = "ReceiverMediaCapabilities")]
    pub receiver_media_capabilities: plist::Data,
}

/// Body of `POST /Ask`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AskRequest {
    #[serde(rename = "SenderComputerName")]
    pub sender_computer_name: String,
    #[serde(rename = "SenderModelName")]
    pub sender_model_name: String,
    /// The sender's mDNS instance name.
    #[serde(rename = "SenderID")]
    pub sender_id: String,
    #[serde(rename = "BundleID")]
    pub bundle_id: String,
    /// JPEG 2000 preview of the first item, when the sender includes one.
    #[serde(rename = "FileIcon")]
    pub file_icon: Option<plist::Data>,
    #[serde(rename = "Files")]
    pub files: Vec<FileMetadata>,
    #[serde(rename = "SenderRecordData")]
    pub sender_record_data: Option<plist::Data>,
}

/// One item offered in an ask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "FileType")]
    pub file_type: String,
    #[serde(rename = "FileIsDirectory")]
    pub is_directory: bool,
    #[serde(rename = "ConvertMediaFormats")]
    pub convert_media_formats: bool,
    #[serde(rename = "FileBomPath")]
    pub bom_path: Option<String>,
}

/// Reply to `POST /Ask` when the peer accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    #[serde(rename = "ReceiverComputerName")]
    pub receiver_computer_name: String,
    #[serde(rename = "ReceiverModelName")]
    pub receiver_model_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_response_round_trips() {
        let response = DiscoverResponse {
            receiver_computer_name: "kitchen-laptop".into(),
            receiver_model_name: "kitchen-laptop".into(),
            receiver_media_capabilities: plist::Data::from(b"{\"Version\":1}".to_vec()),
        };
        let bytes = encode_plist(&response).unwrap();
        let decoded: DiscoverResponse = decode_plist(&bytes).unwrap();
        assert_eq!(decoded.receiver_computer_name, "kitchen-laptop");
        assert_eq!(
            Vec::<u8>::from(decoded.receiver_media_capabilities),
            b"{\"Version\":1}".to_vec()
        );
    }

    #[test]
    fn records_use_apple_wire_keys() {
        let bytes = encode_plist(&AskResponse {
            receiver_computer_name: "a".into(),
            receiver_model_name: "b".into(),
        })
        .unwrap();
        let value: plist::Value = decode_plist(&bytes).unwrap();
        let dict = value.as_dictionary().unwrap();
        assert!(dict.contains_key("ReceiverComputerName"));
        assert!(dict.contains_key("ReceiverModelName"));
    }

    #[test]
    fn ask_request_decodes_from_dictionary() {
        let mut file = plist::Dictionary::new();
        file.insert("FileName".into(), plist::Value::String("photo.jpg".into()));
        file.insert("FileType".into(), plist::Value::String("public.jpeg".into()));
        file.insert("FileIsDirectory".into(), plist::Value::Boolean(false));
        file.insert("ConvertMediaFormats".into(), plist::Value::Boolean(false));

        let mut dict = plist::Dictionary::new();
        dict.insert("SenderComputerName".into(), plist::Value::String("iPhone".into()));
        dict.insert("SenderModelName".into(), plist::Value::String("iPhone14,2".into()));
        dict.insert("SenderID".into(), plist::Value::String("0123456789ab".into()));
        dict.insert("BundleID".into(), plist::Value::String("com.apple.finder".into()));
        dict.insert(
            "Files".into(),
            plist::Value::Array(vec![plist::Value::Dictionary(file)]),
        );

        let bytes = encode_plist(&plist::Value::Dictionary(dict)).unwrap();
        let request: AskRequest = decode_plist(&bytes).unwrap();
        assert_eq!(request.sender_computer_name, "iPhone");
        assert_eq!(request.files.len(), 1);
        assert_eq!(request.files[0].file_name, "photo.jpg");
        assert!(request.file_icon.is_none());
        assert!(request.sender_record_data.is_none());
    }

    #[test]
    fn missing_fields_default() {
        let bytes = encode_plist(&plist::Value::Dictionary(plist::Dictionary::new())).unwrap();
        let request: DiscoverRequest = decode_plist(&bytes).unwrap();
        assert!(request.sender_record_data.is_none());
    }

    #[test]
    fn decode_enforces_input_cap() {
        let oversized = vec![0u8; PLIST_MAX_BYTES + 1];
        assert!(decode_plist::<DiscoverRequest>(&oversized).is_err());
    }

    #[test]
    fn encode_enforces_output_cap() {
        let blob = DiscoverResponse {
            receiver_computer_name: "x".into(),
            receiver_model_name: "y".into(),
            receiver_media_capabilities: plist::Data::from(vec![0u8; PLIST_MAX_BYTES]),
        };
        assert!(encode_plist(&blob).is_err());
    }

    #[test]
    fn garbage_input_is_a_plist_error() {
        let err = decode_plist::<DiscoverRequest>(b"not a plist").unwrap_err();
        assert!(matches!(err, BridgeError::Plist(_)));
    }
}
