//! The AirDrop endpoint handlers: Discover, Ask and Upload.
//!
//! Each handler runs with the peer already resolved from the `Host`
//! header. Discover and Ask translate between Apple property lists and hub
//! messages; Upload streams the request body through the gzip CPIO
//! extractor and hands every delivered file to the peer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::cpio::GzipExtractor;
use crate::protocols::channel::Peer;
use crate::protocols::http_server::encode_path_segment;
use crate::protocols::messages::{AskFile, AskRequestMsg};
use crate::protocols::registry::Registry;
use crate::protocols::sender_record;
use crate::protocols::wire::{
    decode_plist, encode_plist, AskRequest, AskResponse, DiscoverRequest, DiscoverResponse,
};
use crate::utils::{ident, BridgeError, BridgeResult};

/// Only body type `/Upload` accepts.
pub const UPLOAD_CONTENT_TYPE: &str = "application/x-cpio";

pub struct AirDropService {
    pub registry: Arc<Registry>,
    upload_root: PathBuf,
}

impl AirDropService {
    pub fn new(registry: Arc<Registry>, upload_root: PathBuf) -> Self {
        AirDropService {
            registry,
            upload_root,
        }
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    /// `POST /Discover`: validate the sender record if one is present and
    /// introduce the receiver. Everyone mode: an absent or empty record is
    /// tolerated, a present one must parse and chain to the Apple root.
    pub async fn discover(&self, peer: &Peer, body: &[u8]) -> BridgeResult<Vec<u8>> {
        let request: DiscoverRequest = decode_plist(body)?;
        match request.sender_record_data {
            None => info!(peer = %peer.id, "discover without sender record, everyone mode"),
            Some(data) => {
                let data = Vec::<u8>::from(data);
                if data.is_empty() {
                    info!(peer = %peer.id, "discover with empty sender record, everyone mode");
                } else {
                    let record = sender_record::verify(&data)?;
                    // Contact-restricted mode would filter on this payload;
                    // everyone mode only logs that it was readable.
                    match decode_plist::<plist::Value>(&record.contact_payload) {
                        Ok(_) => debug!(peer = %peer.id, "sender record verified"),
                        Err(e) => {
                            debug!(peer = %peer.id, error = %e, "sender record content did not decode")
                        }
                    }
                }
            }
        }

        let capabilities = serde_json::to_vec(&serde_json::json!({ "Version": 1 }))
            .map_err(|e| BridgeError::Other(e.into()))?;
        encode_plist(&DiscoverResponse {
            receiver_computer_name: peer.display_name(),
            receiver_model_name: peer.display_name(),
            receiver_media_capabilities: plist::Data::from(capabilities),
        })
    }

    /// `POST /Ask`: forward the transfer request to the peer and wait for
    /// its decision. A rejection surfaces as [`BridgeError::Rejected`],
    /// which the server turns into 406.
    pub async fn ask(&self, peer: &Peer, body: &[u8]) -> BridgeResult<Vec<u8>> {
        let request: AskRequest = decode_plist(body)?;
        info!(
            peer = %peer.id,
            sender = %request.sender_computer_name,
            files = request.files.len(),
            "transfer offered"
        );

        let files = request
            .files
            .iter()
            .map(|file| AskFile {
                name: file.file_name.clone(),
                file_type: file.file_type.clone(),
                is_directory: file.is_directory,
            })
            .collect();
        let icon = request
            .file_icon
            .map(|data| base64::engine::general_purpose::STANDARD.encode(Vec::<u8>::from(data)));

        let accepted = peer
            .ask(AskRequestMsg {
                sender_computer_name: request.sender_computer_name,
                sender_model_name: request.sender_model_name,
                sender_id: request.sender_id,
                bundle_id: request.bundle_id,
                icon,
                files,
                ..AskRequestMsg::default()
            })
            .await?;
        if !accepted {
            info!(peer = %peer.id, "transfer rejected");
            return Err(BridgeError::Rejected);
        }

        encode_plist(&AskResponse {
            receiver_computer_name: peer.display_name(),
            receiver_model_name: peer.display_name(),
        })
    }

    /// `POST /Upload`: stream the gzip CPIO body into a fresh staging
    /// directory, move the delivered files under the upload root and notify
    /// the peer of each. The staging directory is removed on every exit
    /// path; removal failures only warn.
    pub async fn upload<R>(&self, peer: &Arc<Peer>, body: &mut R) -> BridgeResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let transfer_id = ident::random_id();
        let staging = std::env::temp_dir().join(&transfer_id);
        tokio::fs::create_dir_all(&staging).await?;

        let result = self
            .extract_and_deliver(peer, body, &staging, &transfer_id)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
        }
        result
    }

    async fn extract_and_deliver<R>(
        &self,
        peer: &Arc<Peer>,
        body: &mut R,
        staging: &Path,
        transfer_id: &str,
    ) -> BridgeResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut extractor = GzipExtractor::new(staging);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            extractor.push(&buf[..n])?;
        }
        let files = extractor.finish()?;
        info!(peer = %peer.id, transfer = transfer_id, files = files.len(), "archive extracted");

        let dest_root = self.upload_root.join(&peer.id).join(transfer_id);
        for path in files {
            let rel = path
                .strip_prefix(staging)
                .map_err(|_| {
                    BridgeError::Archive("extracted file left the staging directory".into())
                })?
                .to_path_buf();
            let dest = dest_root.join(&rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            move_file(&path, &dest).await?;

            let url = format!("{}/{}/{}", peer.base_url, transfer_id, url_path(&rel));
            let name = rel.to_string_lossy().into_owned();
            debug!(peer = %peer.id, file = %name, "announcing delivered file");
            peer.notify_uploaded(name, url).await?;
        }
        Ok(())
    }
}

/// Rename where possible, copy-and-delete when the upload root lives on a
/// different filesystem than the staging directory.
async fn move_file(from: &Path, to: &Path) -> BridgeResult<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}

fn url_path(rel: &Path) -> String {
    rel.components()
        .map(|c| encode_path_segment(&c.as_os_str().to_string_lossy()))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdns::Responder;
    use crate::protocols::channel::PeerChannel;
    use crate::protocols::messages::{AskResponseMsg, FileUploadResponse, HubMessage};
    use crate::utils::octal::format_octal;
    use futures::{SinkExt, StreamExt};
    use std::io::Write;
    use tokio_util::codec::{Framed, LinesCodec};
    use tokio_util::sync::CancellationToken;

    fn service(upload_root: &Path) -> AirDropService {
        let responder = Arc::new(Responder::new(&[]));
        let registry = Arc::new(Registry::new(responder, &[], 8771));
        AirDropService::new(registry, upload_root.to_path_buf())
    }

    fn standalone_peer(id: &str) -> (Arc<Peer>, PeerChannel) {
        Peer::new(
            id.to_string(),
            format!("https://169.254.1.2:8771/uploads/{id}"),
        )
    }

    /// Peer whose channel is live on a duplex pipe, plus the remote end.
    fn live_peer(id: &str) -> (Arc<Peer>, Framed<tokio::io::DuplexStream, LinesCodec>) {
        let (bridge_io, peer_io) = tokio::io::duplex(256 * 1024);
        let (peer, channel) = standalone_peer(id);
        tokio::spawn(channel.run(bridge_io, CancellationToken::new()));
        (peer, Framed::new(peer_io, LinesCodec::new()))
    }

    fn cpio_archive(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut push = |name: &str, mode: u32, data: &[u8]| {
            bytes.extend_from_slice(b"070707");
            let fields: [(u32, usize); 10] = [
                (0, 6),
                (1, 6),
                (mode, 6),
                (0, 6),
                (0, 6),
                (1, 6),
                (0, 6),
                (0, 11),
                (name.len() as u32 + 1, 6),
                (data.len() as u32, 11),
            ];
            for (value, width) in fields {
                bytes.extend_from_slice(format_octal(value, width).as_bytes());
            }
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(data);
        };
        for (name, data) in entries {
            push(name, 0o100644, data);
        }
        push("TRAILER!!!", 0, b"");
        bytes
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn discover_without_record_reports_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (peer, _channel) = standalone_peer("abc123def456");

        let body = encode_plist(&DiscoverRequest::default()).unwrap();
        let response = service.discover(&peer, &body).await.unwrap();

        let decoded: DiscoverResponse = decode_plist(&response).unwrap();
        assert_eq!(decoded.receiver_computer_name, "abc123def456");
        assert_eq!(decoded.receiver_model_name, "abc123def456");
        assert_eq!(
            Vec::<u8>::from(decoded.receiver_media_capabilities),
            b"{\"Version\":1}".to_vec()
        );
    }

    #[tokio::test]
    async fn discover_rejects_malformed_sender_record() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (peer, _channel) = standalone_peer("abc123def456");

        let body = encode_plist(&DiscoverRequest {
            sender_record_data: Some(plist::Data::from(b"definitely not cms".to_vec())),
        })
        .unwrap();
        let err = service.discover(&peer, &body).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn ask_accepted_returns_receiver_names() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (peer, mut remote) = live_peer("abc123def456");

        let answer = tokio::spawn(async move {
            let line = remote.next().await.unwrap().unwrap();
            let message: HubMessage = serde_json::from_str(&line).unwrap();
            let HubMessage::AskRequest(request) = message else {
                panic!("expected askRequest");
            };
            assert_eq!(request.sender_computer_name, "iPhone");
            assert_eq!(request.files.len(), 1);
            remote
                .send(
                    serde_json::to_string(&HubMessage::AskResponse(AskResponseMsg {
                        id: 99,
                        reply_to: Some(request.id),
                        accepted: true,
                    }))
                    .unwrap(),
                )
                .await
                .unwrap();
        });

        let body = encode_plist(&AskRequest {
            sender_computer_name: "iPhone".into(),
            files: vec![crate::protocols::wire::FileMetadata {
                file_name: "photo.jpg".into(),
                file_type: "public.jpeg".into(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();

        let response = service.ask(&peer, &body).await.unwrap();
        answer.await.unwrap();
        let decoded: AskResponse = decode_plist(&response).unwrap();
        assert_eq!(decoded.receiver_computer_name, "abc123def456");
    }

    #[tokio::test]
    async fn ask_rejected_maps_to_406() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (peer, mut remote) = live_peer("abc123def456");

        tokio::spawn(async move {
            let line = remote.next().await.unwrap().unwrap();
            let message: HubMessage = serde_json::from_str(&line).unwrap();
            let HubMessage::AskRequest(request) = message else {
                panic!("expected askRequest");
            };
            remote
                .send(
                    serde_json::to_string(&HubMessage::AskResponse(AskResponseMsg {
                        id: 99,
                        reply_to: Some(request.id),
                        accepted: false,
                    }))
                    .unwrap(),
                )
                .await
                .unwrap();
        });

        let body = encode_plist(&AskRequest::default()).unwrap();
        let err = service.ask(&peer, &body).await.unwrap_err();
        assert!(matches!(err, BridgeError::Rejected));
        assert_eq!(err.http_status(), 406);
    }

    #[tokio::test]
    async fn upload_delivers_files_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (peer, mut remote) = live_peer("abc123def456");

        // Ack every fileUploadRequest, remembering the URLs.
        let acker = tokio::spawn(async move {
            let mut urls = Vec::new();
            for _ in 0..2 {
                let line = remote.next().await.unwrap().unwrap();
                let message: HubMessage = serde_json::from_str(&line).unwrap();
                let HubMessage::FileUploadRequest(request) = message else {
                    panic!("expected fileUploadRequest");
                };
                urls.push(request.url.clone());
                remote
                    .send(
                        serde_json::to_string(&HubMessage::FileUploadResponse(
                            FileUploadResponse {
                                id: 1000,
                                reply_to: Some(request.id),
                            },
                        ))
                        .unwrap(),
                    )
                    .await
                    .unwrap();
            }
            urls
        });

        let body = gzip(&cpio_archive(&[
            ("notes/today.txt", b"remember the milk".to_vec()),
            ("photo.jpg", vec![0xff; 2048]),
        ]));
        service.upload(&peer, &mut body.as_slice()).await.unwrap();

        let urls = acker.await.unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].starts_with("https://169.254.1.2:8771/uploads/abc123def456/"));
        assert!(urls[0].ends_with("/notes/today.txt"));

        // Files moved under upload_root/<peer>/<transfer>/.
        let peer_dir = dir.path().join("abc123def456");
        let transfer_dir = std::fs::read_dir(&peer_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let delivered = transfer_dir.path().join("notes/today.txt");
        assert_eq!(std::fs::read(delivered).unwrap(), b"remember the milk");

        // Staging directory under the temp dir is gone.
        let transfer_id = transfer_dir.file_name();
        assert!(!std::env::temp_dir().join(transfer_id).exists());
    }

    #[tokio::test]
    async fn upload_with_bad_body_is_an_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (peer, _remote) = live_peer("abc123def456");

        let err = service
            .upload(&peer, &mut b"not gzip at all".as_slice())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 500);
    }
}
