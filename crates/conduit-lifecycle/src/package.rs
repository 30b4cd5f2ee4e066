//! Package resolution.
//!
//! Turns a `PackageInput` into a `PackageHandle` plus the bytes to keep in
//! the package store. Uploaded bytes are stored under `package://{key}`;
//! `file://` and `http://` packages are fetched once and keep their url;
//! `builtin://` packages must name a catalog entry exposing the kind's
//! entry class.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use conduit_core::{
    ConnectorCatalog, ConnectorDefinition, PackageInput, PackageUrl, STORED_SCHEME, WorkloadKind,
};
use conduit_state::PackageHandle;

use crate::error::{LifecycleError, LifecycleResult};

/// A resolved package, ready to be persisted.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub handle: PackageHandle,
    /// Bytes for the package store; `None` for builtin packages.
    pub bytes: Option<Vec<u8>>,
    /// Catalog entry backing a builtin package.
    pub definition: Option<ConnectorDefinition>,
}

#[derive(Clone)]
pub struct PackageResolver {
    catalog: Arc<ConnectorCatalog>,
    fetch_timeout: Duration,
    max_bytes: u64,
}

impl PackageResolver {
    pub fn new(catalog: Arc<ConnectorCatalog>, fetch_timeout: Duration, max_bytes: u64) -> Self {
        Self {
            catalog,
            fetch_timeout,
            max_bytes,
        }
    }

    pub async fn resolve(
        &self,
        kind: WorkloadKind,
        key: &str,
        input: PackageInput,
    ) -> LifecycleResult<ResolvedPackage> {
        match input {
            PackageInput::Inline(bytes) => {
                if bytes.len() as u64 > self.max_bytes {
                    return Err(LifecycleError::InvalidRequest(format!(
                        "package of {} bytes exceeds the {} byte limit",
                        bytes.len(),
                        self.max_bytes
                    )));
                }
                Ok(stored(format!("{STORED_SCHEME}{key}"), bytes))
            }
            PackageInput::Url(PackageUrl::File { path }) => {
                let size = tokio::fs::metadata(&path).await.map(|m| m.len()).map_err(|e| {
                    LifecycleError::PackageUnavailable(format!("cannot read file://{path}: {e}"))
                })?;
                if size > self.max_bytes {
                    return Err(LifecycleError::PackageUnavailable(format!(
                        "file://{path} exceeds the {} byte limit",
                        self.max_bytes
                    )));
                }
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    LifecycleError::PackageUnavailable(format!("cannot read file://{path}: {e}"))
                })?;
                if bytes.is_empty() {
                    return Err(LifecycleError::PackageUnavailable(format!(
                        "file://{path} is empty"
                    )));
                }
                debug!(%path, size = bytes.len(), "package read from file");
                Ok(stored(format!("file://{path}"), bytes))
            }
            PackageInput::Url(PackageUrl::Http { url }) => {
                let bytes = fetch_http(&url, self.fetch_timeout, self.max_bytes)
                    .await
                    .map_err(|e| LifecycleError::PackageUnavailable(format!("{url}: {e}")))?;
                info!(%url, size = bytes.len(), "package downloaded");
                Ok(stored(url, bytes))
            }
            PackageInput::Url(PackageUrl::Builtin { name }) => {
                let definition = self.builtin(kind, &name)?.clone();
                Ok(ResolvedPackage {
                    handle: PackageHandle {
                        location: format!("builtin://{name}"),
                        digest: String::new(),
                        size_bytes: 0,
                    },
                    bytes: None,
                    definition: Some(definition),
                })
            }
        }
    }

    /// Catalog entry for a builtin package already recorded on a connector.
    pub fn definition_for(
        &self,
        kind: WorkloadKind,
        handle: &PackageHandle,
    ) -> LifecycleResult<Option<&ConnectorDefinition>> {
        match handle.location.strip_prefix("builtin://") {
            Some(name) => self.builtin(kind, name).map(Some),
            None => Ok(None),
        }
    }

    fn builtin(&self, kind: WorkloadKind, name: &str) -> LifecycleResult<&ConnectorDefinition> {
        let definition = self.catalog.get(name).ok_or_else(|| {
            LifecycleError::PackageUnavailable(format!("built-in {kind} {name} is not available"))
        })?;
        if definition.class_for(kind).is_none() {
            return Err(LifecycleError::PackageUnavailable(format!(
                "built-in connector {name} does not provide a {kind}"
            )));
        }
        Ok(definition)
    }
}

fn stored(location: String, bytes: Vec<u8>) -> ResolvedPackage {
    ResolvedPackage {
        handle: PackageHandle {
            location,
            digest: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
        },
        bytes: Some(bytes),
        definition: None,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// GET an `http://` url over a single HTTP/1 connection.
async fn fetch_http(url: &str, timeout: Duration, max_bytes: u64) -> Result<Vec<u8>, String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| "not an http url".to_string())?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let address = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| format!("connection failed: {e}"))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| format!("handshake failed: {e}"))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", authority)
            .header("user-agent", "conduit/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| format!("bad request: {e}"))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("server answered {}", resp.status()));
        }
        let limit = usize::try_from(max_bytes).unwrap_or(usize::MAX);
        let body = Limited::new(resp.into_body(), limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    format!("package exceeds the {max_bytes} byte limit")
                } else {
                    format!("reading body failed: {e}")
                }
            })?
            .to_bytes();
        if body.is_empty() {
            return Err("empty package".to_string());
        }
        Ok(body.to_vec())
    })
    .await;

    match result {
        Ok(fetched) => fetched,
        Err(_) => Err(format!("download timed out after {timeout:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::ConfigSchema;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn catalog() -> Arc<ConnectorCatalog> {
        Arc::new(
            ConnectorCatalog::new(vec![ConnectorDefinition {
                name: "datagen".to_string(),
                description: "synthetic records".to_string(),
                source_class: Some("org.example.DataGenSource".to_string()),
                sink_class: None,
                config_schema: ConfigSchema::default(),
            }])
            .unwrap(),
        )
    }

    fn resolver() -> PackageResolver {
        PackageResolver::new(catalog(), Duration::from_secs(5), 64)
    }

    #[tokio::test]
    async fn inline_bytes_are_stored_under_the_key() {
        let resolved = resolver()
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Inline(b"abc".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.handle.location, "package://source/t/n/s");
        assert_eq!(resolved.handle.size_bytes, 3);
        assert_eq!(
            resolved.handle.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(resolved.bytes.as_deref(), Some(&b"abc"[..]));
    }

    #[tokio::test]
    async fn file_package_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.nar");
        std::fs::write(&path, b"connector").unwrap();
        let url = format!("file://{}", path.display());

        let resolved = resolver()
            .resolve(
                WorkloadKind::Sink,
                "sink/t/n/k",
                PackageInput::Url(PackageUrl::parse(&url).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.handle.location, url);
        assert_eq!(resolved.handle.size_bytes, 9);
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let err = resolver()
            .resolve(
                WorkloadKind::Sink,
                "sink/t/n/k",
                PackageInput::Url(PackageUrl::File {
                    path: "/definitely/not/here.nar".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PackageUnavailable(_)));
    }

    #[tokio::test]
    async fn builtin_must_expose_the_kind() {
        let r = resolver();
        let ok = r
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Url(PackageUrl::Builtin {
                    name: "datagen".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(ok.handle.location, "builtin://datagen");
        assert!(ok.bytes.is_none());
        assert!(ok.definition.is_some());

        let err = r
            .resolve(
                WorkloadKind::Sink,
                "sink/t/n/k",
                PackageInput::Url(PackageUrl::Builtin {
                    name: "datagen".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PackageUnavailable(_)));

        let err = r
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Url(PackageUrl::Builtin {
                    name: "nope".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PackageUnavailable(_)));
    }

    /// Serve one canned HTTP response on a random port.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "{status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/pkg/c.nar")
    }

    #[tokio::test]
    async fn http_package_is_downloaded() {
        let url = serve_once("HTTP/1.1 200 OK", b"remote-bytes").await;
        let resolved = resolver()
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Url(PackageUrl::parse(&url).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.handle.location, url);
        assert_eq!(resolved.bytes.as_deref(), Some(&b"remote-bytes"[..]));
    }

    #[tokio::test]
    async fn http_error_status_is_unavailable() {
        let url = serve_once("HTTP/1.1 404 Not Found", b"").await;
        let err = resolver()
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Url(PackageUrl::parse(&url).unwrap()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PackageUnavailable(msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn oversized_http_package_is_cut_off() {
        let url = serve_once("HTTP/1.1 200 OK", &[7u8; 100]).await;
        let err = resolver()
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Url(PackageUrl::parse(&url).unwrap()),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(&err, LifecycleError::PackageUnavailable(msg) if msg.contains("byte limit")),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn oversized_inline_and_file_packages_are_rejected() {
        let err = resolver()
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Inline(vec![1u8; 65]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidRequest(_)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.nar");
        std::fs::write(&path, [0u8; 65]).unwrap();
        let err = resolver()
            .resolve(
                WorkloadKind::Source,
                "source/t/n/s",
                PackageInput::Url(PackageUrl::File {
                    path: path.display().to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PackageUnavailable(_)));
    }
}
