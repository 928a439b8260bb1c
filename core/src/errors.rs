use thiserror::Error;

/// Semantic failure classes of the control plane. The class decides the
/// policy at the operator boundary: retryable failures change no state,
/// quota violations park the crawl, permanent failures are terminal, and
/// accounting drift triggers a recalculation job instead of a crash.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
  #[error("retryable infrastructure failure: {0}")]
  RetryableInfra(String),

  #[error("quota exceeded: {0}")]
  QuotaExceeded(String),

  #[error("user requested: {0}")]
  UserRequested(String),

  #[error("permanent failure: {0}")]
  Permanent(String),

  #[error("accounting drift: {0}")]
  AccountingDrift(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_display() {
    let err = ControlPlaneError::AccountingDrift("bytesStored is negative".to_string());
    assert_eq!(
      err.to_string(),
      "accounting drift: bytesStored is negative"
    );
  }
}
