/// Normalize a dialable number to the canonical digit-only form the provider
/// expects: every non-digit stripped, then leading zeros dropped. The gateway
/// client does not normalize; callers must pass numbers through here first.
pub fn normalize_msisdn(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() && !digits.is_empty() {
        // all-zero input, keep a single zero rather than an empty number
        return "0".to_string();
    }
    trimmed.to_string()
}
