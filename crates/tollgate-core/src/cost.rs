//! Cost accounting — converts an operation into charged read/write units.
//!
//! The accountant is a pure function of its inputs: it never denies a
//! request and never consults limiter state. Charges are computed in
//! fixed-size blocks (1 KB by default), rounding partial blocks up, with a
//! minimum of one unit of the operation's dominant resource kind.

use crate::config::{CostConfig, SizeLimitsConfig};
use crate::error::{AdmissionError, AdmissionResult};
use crate::types::{Charge, Consistency, OperationKind};

/// Shape of one operation, as seen by the cost accountant.
#[derive(Debug, Clone, Copy)]
pub struct OperationProfile {
    pub kind: OperationKind,
    /// Size of the payload the operation moves (row read or written).
    pub payload_bytes: u64,
    pub consistency: Consistency,
    /// For writes that return the previous row or perform a conditional
    /// check: size of the existing row that must be read back.
    pub existing_row_bytes: Option<u64>,
    /// For queries: number of keys examined, including keys that matched
    /// no rows. Scans are billed for rows scanned, not rows returned.
    pub keys_examined: u64,
}

impl OperationProfile {
    pub fn new(kind: OperationKind, payload_bytes: u64) -> Self {
        Self {
            kind,
            payload_bytes,
            consistency: Consistency::Eventual,
            existing_row_bytes: None,
            keys_examined: 0,
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_existing_row(mut self, bytes: u64) -> Self {
        self.existing_row_bytes = Some(bytes);
        self
    }

    pub fn with_keys_examined(mut self, keys: u64) -> Self {
        self.keys_examined = keys;
        self
    }
}

/// Converts operation size, kind, and consistency into charged units.
#[derive(Debug, Clone)]
pub struct CostAccountant {
    config: CostConfig,
}

impl CostAccountant {
    pub fn new(config: CostConfig) -> Self {
        Self { config }
    }

    /// Number of whole blocks covering `bytes`, at least one.
    fn blocks(&self, bytes: u64) -> u32 {
        let block = self.config.block_bytes.max(1);
        u32::try_from(bytes.div_ceil(block)).unwrap_or(u32::MAX).max(1)
    }

    /// Compute the charge for one operation.
    ///
    /// Deterministic: identical inputs always yield identical charges.
    pub fn charge(&self, op: &OperationProfile) -> Charge {
        match op.kind {
            OperationKind::Get => Charge::read(self.read_units(op)),
            OperationKind::Query => {
                // Zero-result scans still bill a minimum read unit per key
                // examined.
                let scanned = u32::try_from(op.keys_examined).unwrap_or(u32::MAX);
                let base = self.blocks(op.payload_bytes).max(scanned);
                Charge::read(self.apply_consistency(base, op.consistency))
            }
            OperationKind::Put | OperationKind::Delete => {
                let mut charge = Charge::write(self.blocks(op.payload_bytes));
                if let Some(existing) = op.existing_row_bytes {
                    // Return-row and conditional writes read the existing
                    // row at its own size, at the eventual read rate.
                    charge = charge + Charge::read(self.blocks(existing));
                }
                charge
            }
            // DDL carries no data payload; its rate is policed separately.
            OperationKind::Ddl => Charge::write(1),
        }
    }

    fn read_units(&self, op: &OperationProfile) -> u32 {
        self.apply_consistency(self.blocks(op.payload_bytes), op.consistency)
    }

    fn apply_consistency(&self, units: u32, consistency: Consistency) -> u32 {
        match consistency {
            Consistency::Eventual => units,
            Consistency::Absolute => {
                units.saturating_mul(self.config.absolute_read_multiplier.max(1))
            }
        }
    }

    /// Validate request shape against the configured size limits.
    ///
    /// Violations are non-retryable user errors; the caller must change
    /// the request.
    pub fn check_sizes(
        limits: &SizeLimitsConfig,
        request_bytes: u64,
        key_bytes: u64,
        row_bytes: u64,
        batch_operations: u32,
    ) -> AdmissionResult<()> {
        if request_bytes > limits.max_request_bytes {
            return Err(AdmissionError::RequestSizeLimit {
                actual: request_bytes,
                limit: limits.max_request_bytes,
            });
        }
        if key_bytes > limits.max_key_bytes {
            return Err(AdmissionError::KeySizeLimit {
                actual: key_bytes,
                limit: limits.max_key_bytes,
            });
        }
        if row_bytes > limits.max_row_bytes {
            return Err(AdmissionError::RowSizeLimit {
                actual: row_bytes,
                limit: limits.max_row_bytes,
            });
        }
        if batch_operations > limits.max_batch_operations {
            return Err(AdmissionError::BatchOperationNumberLimit {
                actual: batch_operations,
                limit: limits.max_batch_operations,
            });
        }
        Ok(())
    }
}

impl Default for CostAccountant {
    fn default() -> Self {
        Self::new(CostConfig::default())
    }
}
