//! Client for a remote signer speaking the
//! [Remote Signing API](https://github.com/ethereum/remote-signing-api).
//!
//! Two request lanes: a high-priority one for time-critical signatures
//! (blocks, attestations, sync messages, RANDAO) and a low-priority one,
//! bounded to ten concurrent requests, for everything else.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use vigil_shared::remote_signer::{SignResponse, SignableMessage};

use crate::metrics::Metrics;

const LOW_PRIORITY_CONNECTION_LIMIT: usize = 10;
/// Batches up to this size sign concurrently on the current runtime; larger
/// ones move to a dedicated worker thread.
pub const SIGNING_BATCH_SIZE: usize = 100;
const SIGNER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("NOK status code received ({status}) from remote signer: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("no signer configured for pubkey {0}")]
    PubkeyNotFound(String),
    #[error("signing worker thread failed: {0}")]
    Worker(String),
}

/// A message, its signature and the pubkey it was signed for.
pub type SignedMessage = (SignableMessage, String, String);

pub struct RemoteSigner {
    pub url: String,
    pub host: String,
    high_priority_client: Client,
    low_priority_client: Client,
    low_priority_permits: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl RemoteSigner {
    pub fn new(url: &str, metrics: Arc<Metrics>) -> Result<Self, SignerError> {
        let normalized = url.strip_suffix('/').unwrap_or(url).to_owned();
        let parsed = reqwest::Url::parse(&normalized).map_err(|e| SignerError::Worker(format!(
            "invalid remote signer url {url}: {e}"
        )))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SignerError::Worker(format!("failed to parse hostname from {url}")))?
            .to_owned();

        let user_agent = concat!("vigil/", env!("CARGO_PKG_VERSION"));
        let high_priority_client = Client::builder()
            .timeout(SIGNER_TIMEOUT)
            .user_agent(user_agent)
            .build()?;
        let low_priority_client = Client::builder()
            .timeout(SIGNER_TIMEOUT)
            .user_agent(user_agent)
            .build()?;

        Ok(RemoteSigner {
            url: normalized,
            host,
            high_priority_client,
            low_priority_client,
            low_priority_permits: Arc::new(Semaphore::new(LOW_PRIORITY_CONNECTION_LIMIT)),
            metrics,
        })
    }

    pub async fn get_public_keys(&self) -> Result<Vec<String>, SignerError> {
        let url = format!("{}/api/v1/eth2/publicKeys", self.url);
        let response = self.low_priority_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SignerError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn sign(
        &self,
        message: SignableMessage,
        identifier: &str,
    ) -> Result<SignedMessage, SignerError> {
        let url = format!("{}/api/v1/eth2/sign/{identifier}", self.url);

        // The permit bounds concurrency on the low-priority lane; the
        // high-priority lane is never made to wait.
        let _permit = if message.is_high_priority() {
            None
        } else {
            Some(
                Arc::clone(&self.low_priority_permits)
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed"),
            )
        };
        let client = if message.is_high_priority() {
            &self.high_priority_client
        } else {
            &self.low_priority_client
        };

        let response = client.post(&url).json(&message).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SignerError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let signature: SignResponse = response.json().await?;
        self.metrics
            .signed_messages
            .with_label_values(&[message.kind()])
            .inc();
        Ok((message, signature.signature, identifier.to_owned()))
    }

    async fn sign_batch_concurrently(
        self: &Arc<Self>,
        messages: Vec<SignableMessage>,
        identifiers: Vec<String>,
    ) -> Vec<SignedMessage> {
        let mut set = JoinSet::new();
        for (message, identifier) in messages.into_iter().zip(identifiers) {
            let signer = Arc::clone(self);
            set.spawn(async move { signer.sign(message, &identifier).await });
        }

        let mut signed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(result)) => signed.push(result),
                Ok(Err(e)) => {
                    self.metrics.inc_error(crate::metrics::ErrorType::Signature);
                    tracing::warn!("Failed to get signature from {}: {e}", self.host);
                }
                Err(e) => {
                    self.metrics.inc_error(crate::metrics::ErrorType::Signature);
                    tracing::warn!("Signing task failed: {e}");
                }
            }
        }
        signed
    }

    /// Sign a set of messages, returning the successfully signed subset. A
    /// failed signature never aborts the rest of the batch.
    ///
    /// Batches larger than [`SIGNING_BATCH_SIZE`] are driven from a
    /// dedicated worker thread with its own runtime, keeping the request
    /// encoding overhead off the main scheduler.
    pub async fn sign_in_batches(
        self: &Arc<Self>,
        messages: Vec<SignableMessage>,
        identifiers: Vec<String>,
    ) -> Result<Vec<SignedMessage>, SignerError> {
        if messages.len() != identifiers.len() {
            return Err(SignerError::Worker(
                "number of messages does not match the number of identifiers".into(),
            ));
        }

        if messages.len() <= SIGNING_BATCH_SIZE {
            return Ok(self.sign_batch_concurrently(messages, identifiers).await);
        }

        tracing::debug!("Signing {} messages in a separate thread", messages.len());
        let signer = Arc::clone(self);
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("signing-worker".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build signing runtime");
                let signed = runtime.block_on(async {
                    let mut signed = Vec::with_capacity(messages.len());
                    let mut messages = messages;
                    let mut identifiers = identifiers;
                    while !messages.is_empty() {
                        let take = messages.len().min(SIGNING_BATCH_SIZE);
                        let batch: Vec<SignableMessage> = messages.drain(..take).collect();
                        let batch_ids: Vec<String> = identifiers.drain(..take).collect();
                        signed.extend(signer.sign_batch_concurrently(batch, batch_ids).await);
                    }
                    signed
                });
                let _ = tx.send(signed);
            })
            .map_err(|e| SignerError::Worker(e.to_string()))?;

        rx.await.map_err(|e| SignerError::Worker(e.to_string()))
    }
}
