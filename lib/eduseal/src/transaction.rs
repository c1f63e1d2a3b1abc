//! Transaction id correlation through document keywords
//!
//! Sealing writes exactly one keyword, `transaction_id:<id>`, into the
//! document metadata. Validation scans the keyword list and takes the first
//! entry carrying that key.

pub const TRANSACTION_ID_KEY: &str = "transaction_id";

/// Keyword entry written into a sealed document.
pub fn keyword(transaction_id: &str) -> String {
    format!("{}:{}", TRANSACTION_ID_KEY, transaction_id)
}

/// First `transaction_id:<value>` entry, if any.
///
/// Only the first colon separates key and value, so ids that themselves
/// contain colons survive the round trip. The value is returned verbatim.
pub fn recover<I, S>(keywords: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keywords.into_iter().find_map(|entry| {
        let (key, value) = entry.as_ref().split_once(':')?;
        (key == TRANSACTION_ID_KEY).then(|| value.to_string())
    })
}
