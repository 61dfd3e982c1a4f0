//! Kubernetes-style resource quantities (`500m`, `2`, `128Mi`, `1G`).
//!
//! Values are held exactly in thousandths of the base unit so CPU
//! millicores and memory bytes compare and add without rounding.

/// A parsed quantity, in thousandths of the base unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(u128);

impl Quantity {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(raw.len());
        let (number, suffix) = raw.split_at(split);
        let milli = parse_decimal_milli(number)?;

        let scaled = match suffix {
            "m" => {
                if milli % 1000 != 0 {
                    return None;
                }
                milli / 1000
            }
            "" => milli,
            "k" => milli.checked_mul(1_000)?,
            "M" => milli.checked_mul(1_000_000)?,
            "G" => milli.checked_mul(1_000_000_000)?,
            "T" => milli.checked_mul(1_000_000_000_000)?,
            "Ki" => milli.checked_mul(1 << 10)?,
            "Mi" => milli.checked_mul(1 << 20)?,
            "Gi" => milli.checked_mul(1 << 30)?,
            "Ti" => milli.checked_mul(1 << 40)?,
            _ => return None,
        };
        Some(Self(scaled))
    }

    pub fn millis(&self) -> u128 {
        self.0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Canonical rendering: whole base units when exact, millis otherwise.
    pub fn render(&self) -> String {
        if self.0 % 1000 == 0 {
            (self.0 / 1000).to_string()
        } else {
            format!("{}m", self.0)
        }
    }
}

/// `"1.5"` → 1500. At most three fractional digits.
fn parse_decimal_milli(number: &str) -> Option<u128> {
    let (int, frac) = number.split_once('.').unwrap_or((number, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let int: u128 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let frac_milli: u128 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<3}").parse().ok()?
    };
    int.checked_mul(1000)?.checked_add(frac_milli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_notations() {
        assert_eq!(Quantity::parse("500m").unwrap().millis(), 500);
        assert_eq!(Quantity::parse("1").unwrap().millis(), 1000);
        assert_eq!(Quantity::parse("1.5").unwrap().millis(), 1500);
        assert_eq!(Quantity::parse("0.25").unwrap().millis(), 250);
    }

    #[test]
    fn parses_memory_notations() {
        assert_eq!(Quantity::parse("128Mi").unwrap().millis(), 128 * (1 << 20) * 1000);
        assert_eq!(Quantity::parse("1Gi").unwrap().millis(), (1 << 30) * 1000);
        assert_eq!(Quantity::parse("100M").unwrap().millis(), 100_000_000 * 1000);
        assert_eq!(Quantity::parse("2k").unwrap().millis(), 2_000_000);
    }

    #[test]
    fn rejects_malformed_quantities() {
        for raw in ["", "abc", "1.2345", "1Xi", "0.5m", "."] {
            assert!(Quantity::parse(raw).is_none(), "{raw:?} should not parse");
        }
    }

    #[test]
    fn orders_across_units() {
        assert!(Quantity::parse("1").unwrap() > Quantity::parse("500m").unwrap());
        assert!(Quantity::parse("1Gi").unwrap() > Quantity::parse("1G").unwrap());
    }

    #[test]
    fn renders_sums() {
        let sum = Quantity::parse("500m")
            .unwrap()
            .saturating_add(Quantity::parse("1").unwrap());
        assert_eq!(sum.render(), "1500m");

        let bytes = Quantity::parse("64Mi")
            .unwrap()
            .saturating_add(Quantity::parse("128Mi").unwrap());
        assert_eq!(bytes.render(), "201326592");
    }
}
