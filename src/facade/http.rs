//! JSON-RPC 2.0 client over the three upstream HTTP endpoints.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{ServiceConfig, UpstreamConfig};
use crate::models::{Chunk, IndexedFileRecord};

use super::{CommitReceipt, FacadeError, HealthReport, ServiceHealth, VectorStore};

const VECTOR_STORE: &str = "vector_store";
const SEGMENTATION: &str = "segmentation";
const EMBEDDING: &str = "embedding";

/// JSON-RPC error code some stores use for "no such source".
const CODE_NOT_FOUND: i64 = -32001;

struct Service {
    name: &'static str,
    url: String,
    client: reqwest::Client,
}

impl Service {
    fn new(name: &'static str, cfg: &ServiceConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout_duration())
            .build()?;
        Ok(Self {
            name,
            url: cfg.url.clone(),
            client,
        })
    }
}

/// Production facade speaking JSON-RPC 2.0 to the configured endpoints.
pub struct HttpFacade {
    vector_store: Service,
    segmentation: Service,
    embedding: Service,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl HttpFacade {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, FacadeError> {
        let build = |name, svc| {
            Service::new(name, svc).map_err(|e| FacadeError::Unavailable {
                service: name,
                detail: format!("client construction failed: {e}"),
            })
        };
        Ok(Self {
            vector_store: build(VECTOR_STORE, &cfg.vector_store)?,
            segmentation: build(SEGMENTATION, &cfg.segmentation)?,
            embedding: build(EMBEDDING, &cfg.embedding)?,
            next_id: AtomicU64::new(1),
        })
    }

    /// One JSON-RPC call. Transport faults and 5xx map to `Unavailable`,
    /// 4xx to `Rejected`, undecodable replies to `Protocol`.
    async fn call(
        &self,
        service: &Service,
        method: &str,
        params: Value,
    ) -> Result<Value, FacadeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(service = service.name, method, id, "jsonrpc call");

        let response = service
            .client
            .post(&service.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FacadeError::Unavailable {
                service: service.name,
                detail: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FacadeError::Unavailable {
                service: service.name,
                detail: format!("reading reply: {e}"),
            })?;

        if status.is_server_error() {
            return Err(FacadeError::Unavailable {
                service: service.name,
                detail: format!("{status}: {body}"),
            });
        }
        if status.is_client_error() {
            return Err(FacadeError::Rejected {
                service: service.name,
                detail: format!("{status}: {body}"),
            });
        }
        if status != StatusCode::OK {
            return Err(FacadeError::Protocol {
                service: service.name,
                detail: format!("unexpected status {status}"),
            });
        }

        let reply: RpcReply =
            serde_json::from_str(&body).map_err(|e| FacadeError::Protocol {
                service: service.name,
                detail: format!("undecodable reply: {e}"),
            })?;

        if let Some(err) = reply.error {
            if err.code == CODE_NOT_FOUND {
                return Err(FacadeError::NotFound(err.message));
            }
            return Err(FacadeError::Rejected {
                service: service.name,
                detail: format!("rpc error {}: {}", err.code, err.message),
            });
        }

        reply.result.ok_or_else(|| FacadeError::Protocol {
            service: service.name,
            detail: "reply carries neither result nor error".into(),
        })
    }

    async fn probe(&self, service: &Service) -> ServiceHealth {
        match self.call(service, "health", json!({})).await {
            Ok(_) => ServiceHealth {
                healthy: true,
                detail: None,
            },
            Err(e) => ServiceHealth {
                healthy: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl VectorStore for HttpFacade {
    async fn list_files(&self, dir: &Path) -> Result<Vec<IndexedFileRecord>, FacadeError> {
        let result = self
            .call(
                &self.vector_store,
                "list_files",
                json!({ "directory": dir }),
            )
            .await?;

        serde_json::from_value(result).map_err(|e| FacadeError::Protocol {
            service: VECTOR_STORE,
            detail: format!("list_files result: {e}"),
        })
    }

    async fn prepare_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, FacadeError> {
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let result = self
            .call(&self.segmentation, "segment", json!({ "chunks": chunks }))
            .await?;

        #[derive(Deserialize)]
        struct Segmented {
            chunks: Vec<Chunk>,
        }
        let segmented: Segmented =
            serde_json::from_value(result).map_err(|e| FacadeError::Protocol {
                service: SEGMENTATION,
                detail: format!("segment result: {e}"),
            })?;
        let mut chunks = segmented.chunks;

        let texts: Vec<&str> = chunks.iter().map(|c| c.body.as_str()).collect();
        let result = self
            .call(&self.embedding, "embed", json!({ "texts": texts }))
            .await?;

        #[derive(Deserialize)]
        struct Embedded {
            embeddings: Vec<Vec<f32>>,
        }
        let embedded: Embedded =
            serde_json::from_value(result).map_err(|e| FacadeError::Protocol {
                service: EMBEDDING,
                detail: format!("embed result: {e}"),
            })?;

        if embedded.embeddings.len() != chunks.len() {
            return Err(FacadeError::Rejected {
                service: EMBEDDING,
                detail: format!(
                    "embedding cardinality mismatch: {} texts, {} vectors",
                    chunks.len(),
                    embedded.embeddings.len()
                ),
            });
        }

        for (chunk, embedding) in chunks.iter_mut().zip(embedded.embeddings) {
            chunk
                .metadata
                .insert("embedding".to_string(), json!(embedding));
        }

        Ok(chunks)
    }

    async fn commit_chunks(&self, chunks: &[Chunk]) -> Result<CommitReceipt, FacadeError> {
        let result = self
            .call(
                &self.vector_store,
                "create_chunks",
                json!({ "chunks": chunks }),
            )
            .await?;

        let receipt: CommitReceipt =
            serde_json::from_value(result).map_err(|e| FacadeError::Protocol {
                service: VECTOR_STORE,
                detail: format!("create_chunks result: {e}"),
            })?;

        if receipt.created != chunks.len() as u64 {
            return Err(FacadeError::PartialFailure {
                created: receipt.created,
                submitted: chunks.len() as u64,
            });
        }

        Ok(receipt)
    }

    async fn delete_by_source(&self, source_id: &str) -> Result<u64, FacadeError> {
        let result = self
            .call(
                &self.vector_store,
                "delete_by_source",
                json!({ "source_id": source_id }),
            )
            .await;

        match result {
            Ok(value) => {
                #[derive(Deserialize)]
                struct Deleted {
                    deleted: u64,
                }
                let deleted: Deleted =
                    serde_json::from_value(value).map_err(|e| FacadeError::Protocol {
                        service: VECTOR_STORE,
                        detail: format!("delete_by_source result: {e}"),
                    })?;
                Ok(deleted.deleted)
            }
            // Unknown id means nothing is left to delete.
            Err(FacadeError::NotFound(id)) => {
                warn!(source_id = %id, "delete_by_source: unknown id, treating as deleted");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn health(&self) -> HealthReport {
        let (vs, seg, emb) = tokio::join!(
            self.probe(&self.vector_store),
            self.probe(&self.segmentation),
            self.probe(&self.embedding),
        );

        let mut report = HealthReport::new();
        report.insert(VECTOR_STORE.to_string(), vs);
        report.insert(SEGMENTATION.to_string(), seg);
        report.insert(EMBEDDING.to_string(), emb);
        report
    }
}
