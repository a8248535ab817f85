/// Seconds since the Unix epoch, used to name per-run report files.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A count paired with a noun, pluralized by adding "s".
pub struct Counted<'a> {
    count: usize,
    singular: &'a str,
}

impl<'a> Counted<'a> {
    pub fn regular(count: usize, singular: &'a str) -> Self {
        Counted { count, singular }
    }
}

impl std::fmt::Display for Counted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}{}", self.count, self.singular, if self.count == 1 { "" } else { "s" })
    }
}
