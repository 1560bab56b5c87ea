use tally_core::TallyError;

/// Longest digit run that can still fit in a `u64`.
const MAX_U64_DIGITS: usize = 20;

/// Strictly parse a non-negative integer field.
///
/// Surrounding whitespace is ignored. Signs, decimal points, exponents and
/// anything above `ceiling` are rejected as validation errors.
pub fn parse_non_negative(field: &str, raw: &str, ceiling: u64) -> Result<u64, TallyError> {
    let value = raw.trim();

    if value.is_empty() {
        return Err(TallyError::validation(field, "value is empty"));
    }

    if let Some(rest) = value.strip_prefix('-') {
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TallyError::validation(
                field,
                format!("value {value} is negative"),
            ));
        }
    }

    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TallyError::validation(
            field,
            format!("value '{value}' is not a non-negative integer"),
        ));
    }

    let significant = value.trim_start_matches('0');
    if significant.len() > MAX_U64_DIGITS {
        return Err(TallyError::validation(
            field,
            format!("value {value} is too large"),
        ));
    }

    let parsed: u64 = value
        .parse()
        .map_err(|_| TallyError::validation(field, format!("value {value} is too large")))?;

    if parsed > ceiling {
        return Err(TallyError::validation(
            field,
            format!("value {parsed} exceeds maximum of {ceiling}"),
        ));
    }

    Ok(parsed)
}
