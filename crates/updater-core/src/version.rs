//! Application version comparison.
//!
//! Versions are dotted sequences of parts. Each part is
//! `<number-a><string-b><number-c><extra-d>`, every piece optional, so
//! `128.0`, `128.0.1` and `129.0b3` all compare sensibly. A missing string
//! sorts after any present one (`1.0` is newer than `1.0a1`), `*` is
//! infinite, and `N+` means `(N+1)pre`.

use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq)]
struct VersionPart<'a> {
    a: i64,
    b: Option<&'a str>,
    c: i64,
    d: Option<&'a str>,
}

impl<'a> VersionPart<'a> {
    const ZERO: VersionPart<'static> = VersionPart { a: 0, b: None, c: 0, d: None };

    fn parse(part: &'a str) -> Self {
        if part == "*" {
            return VersionPart { a: i64::MAX, b: None, c: 0, d: None };
        }

        let (a, rest) = split_number(part);
        if rest.starts_with('+') {
            return VersionPart { a: a.saturating_add(1), b: Some("pre"), c: 0, d: None };
        }

        let b_len = rest.find(|c: char| c.is_ascii_digit() || c == '-').unwrap_or(rest.len());
        let b = if b_len == 0 { None } else { Some(&rest[..b_len]) };
        let (c, d) = split_number(&rest[b_len..]);
        let d = if d.is_empty() { None } else { Some(d) };

        VersionPart { a, b, c, d }
    }
}

/// Parses a leading (optionally negative) integer, returning it and the rest.
fn split_number(s: &str) -> (i64, &str) {
    let bytes = s.as_bytes();
    let sign = usize::from(bytes.first() == Some(&b'-'));
    let mut end = sign;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == sign {
        return (0, s);
    }
    (s[..end].parse().unwrap_or(i64::MAX), &s[end..])
}

/// A missing string sorts after a present one.
fn compare_optional(left: Option<&str>, right: Option<&str>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(l), Some(r)) => l.cmp(r),
    }
}

fn compare_parts(left: &VersionPart<'_>, right: &VersionPart<'_>) -> Ordering {
    left.a
        .cmp(&right.a)
        .then_with(|| compare_optional(left.b, right.b))
        .then_with(|| left.c.cmp(&right.c))
        .then_with(|| compare_optional(left.d, right.d))
}

/// Compares two version strings.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let mut lp = left.split('.');
    let mut rp = right.split('.');
    loop {
        match (lp.next(), rp.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.map(VersionPart::parse).unwrap_or(VersionPart::ZERO);
                let r = r.map(VersionPart::parse).unwrap_or(VersionPart::ZERO);
                let ord = compare_parts(&l, &r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Returns true when `(version, build)` is not newer than
/// `(current_version, current_build)`. A candidate without a build id is
/// treated as the same build when the versions are equal.
pub fn is_at_least_as_old_as(
    version: &str,
    build: Option<&str>,
    current_version: &str,
    current_build: Option<&str>,
) -> bool {
    match compare_versions(version, current_version) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => match (build, current_build) {
            (Some(b), Some(cb)) => compare_versions(b, cb) != Ordering::Greater,
            _ => true,
        },
    }
}
