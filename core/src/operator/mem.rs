use super::models::{MEM_SCALE_UP, MEM_SCALE_UP_THRESHOLD, MEM_SOFT_OOM_THRESHOLD};

/// Outcome of the per-pod memory policy for one reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPolicy {
  /// Usage is below the scale-up threshold.
  Ok,
  /// Above the threshold for the first time; scale up only if it holds.
  High,
  /// Sustained high usage across two reconciles; recreate with this many bytes.
  ScaleUp(u64),
  /// At or over the allocation; stop this worker gracefully before the kernel does.
  SoftOom,
}

pub fn evaluate_memory(used: u64, allocated: u64, was_high: bool) -> MemPolicy {
  if allocated == 0 {
    return MemPolicy::Ok;
  }
  let ratio = used as f64 / allocated as f64;
  if ratio >= MEM_SOFT_OOM_THRESHOLD {
    return MemPolicy::SoftOom;
  }
  if ratio >= MEM_SCALE_UP_THRESHOLD {
    if was_high {
      return MemPolicy::ScaleUp((allocated as f64 * MEM_SCALE_UP) as u64);
    }
    return MemPolicy::High;
  }
  MemPolicy::Ok
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_below_threshold() {
    assert_eq!(evaluate_memory(500, 1000, false), MemPolicy::Ok);
    assert_eq!(evaluate_memory(899, 1000, true), MemPolicy::Ok);
  }

  #[test]
  fn test_scale_up_requires_two_reconciles() {
    assert_eq!(evaluate_memory(950, 1000, false), MemPolicy::High);
    assert_eq!(evaluate_memory(950, 1000, true), MemPolicy::ScaleUp(1200));
  }

  #[test]
  fn test_soft_oom_at_full_allocation() {
    assert_eq!(evaluate_memory(1000, 1000, false), MemPolicy::SoftOom);
    assert_eq!(evaluate_memory(1100, 1000, true), MemPolicy::SoftOom);
  }

  #[test]
  fn test_zero_allocation_is_ignored() {
    assert_eq!(evaluate_memory(1000, 0, true), MemPolicy::Ok);
  }
}
