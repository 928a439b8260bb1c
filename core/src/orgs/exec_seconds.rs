use chrono::{DateTime, Datelike, Utc};

/// Month bucket key for execution-second accounting, e.g. "2026-08".
pub fn month_key(now: DateTime<Utc>) -> String {
  format!("{:04}-{:02}", now.year(), now.month())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecPools {
  pub monthly_used: u64,
  pub monthly_quota_secs: u64,
  pub extra_available: u64,
  pub gifted_available: u64,
}

impl ExecPools {
  pub fn monthly_remaining(&self) -> u64 {
    self.monthly_quota_secs.saturating_sub(self.monthly_used)
  }

  pub fn total_remaining(&self) -> u64 {
    self.monthly_remaining() + self.extra_available + self.gifted_available
  }
}

/// How an execution-second delta was absorbed. `unabsorbed` is the tail that
/// found no pool with slack; a nonzero tail means the time quota is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebitSplit {
  pub monthly: u64,
  pub extra: u64,
  pub gifted: u64,
  pub unabsorbed: u64,
}

impl DebitSplit {
  pub fn exhausted(&self) -> bool {
    self.unabsorbed > 0
  }
}

/// Splits `delta` execution seconds across the org's pools in the fixed
/// priority order monthly -> extra -> gifted, spilling to the next pool when
/// one empties mid-debit.
pub fn split_exec_seconds(pools: &ExecPools, delta: u64) -> DebitSplit {
  let monthly = delta.min(pools.monthly_remaining());
  let mut rest = delta - monthly;
  let extra = rest.min(pools.extra_available);
  rest -= extra;
  let gifted = rest.min(pools.gifted_available);
  rest -= gifted;
  DebitSplit {
    monthly,
    extra,
    gifted,
    unabsorbed: rest,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_month_key() {
    let date = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
    assert_eq!(month_key(date), "2026-08");
  }

  #[test]
  fn test_split_fits_in_monthly_pool() {
    let pools = ExecPools {
      monthly_used: 100,
      monthly_quota_secs: 600,
      extra_available: 50,
      gifted_available: 50,
    };
    let split = split_exec_seconds(&pools, 200);
    assert_eq!(
      split,
      DebitSplit {
        monthly: 200,
        extra: 0,
        gifted: 0,
        unabsorbed: 0
      }
    );
  }

  #[test]
  fn test_split_spills_across_pools_in_order() {
    let pools = ExecPools {
      monthly_used: 580,
      monthly_quota_secs: 600,
      extra_available: 15,
      gifted_available: 100,
    };
    let split = split_exec_seconds(&pools, 60);
    assert_eq!(
      split,
      DebitSplit {
        monthly: 20,
        extra: 15,
        gifted: 25,
        unabsorbed: 0
      }
    );
  }

  #[test]
  fn test_split_reports_unabsorbed_tail() {
    let pools = ExecPools {
      monthly_used: 600,
      monthly_quota_secs: 600,
      extra_available: 5,
      gifted_available: 5,
    };
    let split = split_exec_seconds(&pools, 60);
    assert_eq!(split.monthly, 0);
    assert_eq!(split.extra, 5);
    assert_eq!(split.gifted, 5);
    assert_eq!(split.unabsorbed, 50);
    assert!(split.exhausted());
  }

  #[test]
  fn test_split_conserves_delta() {
    let pools = ExecPools {
      monthly_used: 590,
      monthly_quota_secs: 600,
      extra_available: 7,
      gifted_available: 3,
    };
    for delta in [0u64, 1, 9, 10, 19, 20, 21, 1000] {
      let split = split_exec_seconds(&pools, delta);
      assert_eq!(
        split.monthly + split.extra + split.gifted + split.unabsorbed,
        delta
      );
    }
  }
}
