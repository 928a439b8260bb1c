use anyhow::{bail, Result};

/// Parses a Kubernetes resource quantity into a base-unit integer: bytes for
/// memory quantities, millicores for cpu quantities ending in `m`, otherwise
/// the plain integer value. Fractional cores ("0.5") become millicores.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
  let quantity = quantity.trim();
  if quantity.is_empty() {
    bail!("empty quantity");
  }

  let suffixes: [(&str, u64); 10] = [
    ("Ki", 1024),
    ("Mi", 1024 * 1024),
    ("Gi", 1024 * 1024 * 1024),
    ("Ti", 1024u64.pow(4)),
    ("k", 1000),
    ("K", 1000),
    ("M", 1000 * 1000),
    ("G", 1000 * 1000 * 1000),
    ("T", 1000u64.pow(4)),
    ("m", 1),
  ];

  for (suffix, multiplier) in suffixes {
    if let Some(number) = quantity.strip_suffix(suffix) {
      let value: f64 = number.parse()?;
      return Ok((value * multiplier as f64).round() as u64);
    }
  }

  let value: f64 = quantity.parse()?;
  Ok(value.round() as u64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_memory_quantities() {
    assert_eq!(parse_quantity("700Mi").unwrap(), 700 * 1024 * 1024);
    assert_eq!(parse_quantity("1Gi").unwrap(), 1024 * 1024 * 1024);
    assert_eq!(parse_quantity("512k").unwrap(), 512_000);
    assert_eq!(parse_quantity("734003200").unwrap(), 734003200);
  }

  #[test]
  fn test_parse_cpu_quantities() {
    assert_eq!(parse_quantity("900m").unwrap(), 900);
    assert_eq!(parse_quantity("120m").unwrap(), 120);
  }

  #[test]
  fn test_invalid_quantity() {
    assert!(parse_quantity("").is_err());
    assert!(parse_quantity("abc").is_err());
  }
}
