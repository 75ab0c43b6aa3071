//! Search filter helpers.

/// Escapes a value for inclusion in an LDAP search filter (RFC 4515).
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Substitutes positional `{0}`, `{1}`, … placeholders in `template`.
///
/// Placeholders without a matching argument are left untouched. The template is scanned
/// once, so placeholder text inside an argument is copied as-is.
#[must_use]
pub fn format_template(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let arg = tail.find('}').and_then(|close| {
            let digits = &tail[..close];
            let valid = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
            valid
                .then(|| digits.parse::<usize>().ok())
                .flatten()
                .and_then(|idx| args.get(idx))
                .map(|arg| (*arg, close))
        });
        match arg {
            Some((arg, close)) => {
                out.push_str(arg);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Builds the user lookup filter from a format such as `({0}={1})`.
///
/// `{0}` receives the UID attribute name and `{1}` the uid, both escaped.
#[must_use]
pub fn user_search_filter(format: &str, uid_attribute: &str, uid: &str) -> String {
    format_template(
        format,
        &[
            &escape_filter_value(uid_attribute),
            &escape_filter_value(uid),
        ],
    )
}

/// Returns true if `input` has the shape of a search filter: balanced parentheses around
/// a non-empty body.
#[must_use]
pub fn looks_like_filter(input: &str) -> bool {
    let input = input.trim();
    if input.len() < 3 || !input.starts_with('(') || !input.ends_with(')') {
        return false;
    }

    let mut depth = 0usize;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                // The outer parenthesis must only close at the very end.
                if depth == 0 && idx + 1 != input.len() {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && input.contains('=')
}
