//! Confirmation-depth tracking for submitted transactions
//!
//! A transaction counts as final once `head - inclusion_block + 1` reaches the
//! network's required confirmations. Waiting is always bounded by a caller budget.

use crate::chain::{ChainBackend, Receipt};
use crate::error::{fmt_id, WorkflowError, WorkflowResult};

use ethers::types::H256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where a transaction stands relative to finality
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finality {
    /// No receipt yet
    Unknown,
    /// Included but not deep enough
    Pending { confirmations: u64 },
    /// Deep enough and successful
    Final(Receipt),
}

/// Tracks finality for transactions on a specific chain
pub struct FinalityTracker {
    chain_id: u64,
    confirmation_blocks: u64,
    backend: Arc<dyn ChainBackend>,
    poll_interval: Duration,
}

impl FinalityTracker {
    pub fn new(
        chain_id: u64,
        confirmation_blocks: u64,
        backend: Arc<dyn ChainBackend>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain_id,
            confirmation_blocks,
            backend,
            poll_interval,
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// One look at the chain
    pub async fn check(&self, tx_hash: H256) -> WorkflowResult<Finality> {
        let receipt = match self.backend.receipt(tx_hash).await? {
            Some(receipt) => receipt,
            None => return Ok(Finality::Unknown),
        };

        if !receipt.succeeded {
            return Err(WorkflowError::Rejected {
                chain_id: self.chain_id,
                reason: receipt
                    .revert_reason
                    .clone()
                    .unwrap_or_else(|| "transaction reverted".to_string()),
            });
        }

        let head = self.backend.block_number().await?;
        let confirmations = confirmations(head, receipt.block_number);

        if confirmations >= self.confirmation_blocks {
            Ok(Finality::Final(receipt))
        } else {
            Ok(Finality::Pending { confirmations })
        }
    }

    /// Poll until final, failing with `Timeout` once `budget` is spent
    pub async fn wait(&self, tx_hash: H256, budget: Duration) -> WorkflowResult<Receipt> {
        let started = Instant::now();

        let outcome = tokio::time::timeout(budget, self.poll_until_final(tx_hash)).await;
        crate::metrics::record_finality_wait(self.chain_id, started.elapsed());

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Gave up waiting for {} on chain {} after {:?}",
                    fmt_id(&tx_hash),
                    self.chain_id,
                    budget
                );
                Err(WorkflowError::Timeout {
                    operation: format!("finality of tx {}", fmt_id(&tx_hash)),
                    waited: budget,
                })
            }
        }
    }

    async fn poll_until_final(&self, tx_hash: H256) -> WorkflowResult<Receipt> {
        let mut seen_included = false;

        loop {
            match self.check(tx_hash).await? {
                Finality::Final(receipt) => {
                    info!(
                        "Transaction {} final on chain {} (block {})",
                        fmt_id(&tx_hash),
                        self.chain_id,
                        receipt.block_number
                    );
                    return Ok(receipt);
                }
                Finality::Pending { confirmations } => {
                    seen_included = true;
                    debug!(
                        "Transaction {} has {} / {} confirmations on chain {}",
                        fmt_id(&tx_hash),
                        confirmations,
                        self.confirmation_blocks,
                        self.chain_id
                    );
                }
                Finality::Unknown if seen_included => {
                    warn!(
                        "Reorg detected: tx {} no longer included on chain {}",
                        fmt_id(&tx_hash),
                        self.chain_id
                    );
                    return Err(WorkflowError::ReorgDetected {
                        chain_id: self.chain_id,
                        tx_hash,
                    });
                }
                Finality::Unknown => {
                    debug!("Transaction {} not yet included", fmt_id(&tx_hash));
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Number of blocks on top of and including the inclusion block
pub fn confirmations(head: u64, inclusion_block: u64) -> u64 {
    if head < inclusion_block {
        0
    } else {
        head - inclusion_block + 1
    }
}
