//! Canonical values for Kubernetes quantities (`500m`, `1Gi`, `2`, `1e3`).
//! Values are held as exact nano-units so `0.5` and `500m` compare equal.

const NANO: i128 = 1_000_000_000;

fn suffix_multiplier(suffix: &str) -> Option<i128> {
    let kib: i128 = 1024;
    Some(match suffix {
        "n" => 1,
        "u" => 1_000,
        "m" => 1_000_000,
        "" => NANO,
        "k" => NANO * 1_000,
        "M" => NANO * 1_000_000,
        "G" => NANO * 1_000_000_000,
        "T" => NANO * 1_000_000_000_000,
        "P" => NANO * 1_000_000_000_000_000,
        "E" => NANO * 1_000_000_000_000_000_000,
        "Ki" => NANO * kib,
        "Mi" => NANO * kib.pow(2),
        "Gi" => NANO * kib.pow(3),
        "Ti" => NANO * kib.pow(4),
        "Pi" => NANO * kib.pow(5),
        "Ei" => NANO * kib.pow(6),
        _ => return None,
    })
}

/// Parsed quantity and whether it carried a unit suffix or exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    pub nanos: i128,
    pub has_suffix: bool,
}

pub fn parse(s: &str) -> Option<Quantity> {
    let s = s.trim();
    let (negative, body) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let num_end = body.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(body.len());
    let (number, suffix) = body.split_at(num_end);
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() { return None; }
    if int_part.len() > 20 || frac_part.len() > 18 || frac_part.contains('.') { return None; }

    let scale = 10i128.checked_pow(frac_part.len() as u32)?;
    let int_v: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let frac_v: i128 = if frac_part.is_empty() { 0 } else { frac_part.parse().ok()? };
    let mantissa = int_v.checked_mul(scale)?.checked_add(frac_v)?;

    let multiplier = match suffix_multiplier(suffix) {
        Some(m) => m,
        None => decimal_exponent(suffix)?,
    };
    let scaled = mantissa.checked_mul(multiplier)?;
    if scaled % scale != 0 { return None; }
    let nanos = scaled / scale;
    Some(Quantity { nanos: if negative { -nanos } else { nanos }, has_suffix: !suffix.is_empty() })
}

/// `e3` / `E-2` style exponent, expressed as a nano-unit multiplier.
fn decimal_exponent(suffix: &str) -> Option<i128> {
    let rest = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
    let exp: i32 = rest.parse().ok()?;
    let shifted = 9 + exp;
    if !(0..=30).contains(&shifted) { return None; }
    10i128.checked_pow(shifted as u32)
}
