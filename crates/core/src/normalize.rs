//! Title canonicalization and bucket keys.
//!
//! Every record is stored in the bucket addressed by
//! `search_name(name) + ":" + search_name(originalname)`. The folding is
//! lossy on purpose: titles that differ only in case, punctuation, spacing,
//! diacritics or common Cyrillic spelling variants collapse to one key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical "search name" of a title.
///
/// Lowercases, folds diacritics and Cyrillic variants (`ё`→`е`, `щ`→`ш`,
/// Ukrainian `і`/`ї`/`є`/`ґ`), then keeps only `a-z`, `0-9` and `а-я`.
/// Never fails; garbage input yields an empty string. Idempotent.
pub fn search_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars().flat_map(char::to_lowercase) {
        match fold_char(c) {
            Folded::One(f) => push_if_kept(&mut out, f),
            Folded::Two(a, b) => {
                push_if_kept(&mut out, a);
                push_if_kept(&mut out, b);
            }
        }
    }
    out
}

/// Bucket key for a `(name, originalname)` pair.
pub fn bucket_key(name: &str, originalname: &str) -> BucketKey {
    BucketKey(format!("{}:{}", search_name(name), search_name(originalname)))
}

enum Folded {
    One(char),
    Two(char, char),
}

fn fold_char(c: char) -> Folded {
    let f = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'ğ' => 'g',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => 'i',
        'ł' => 'l',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ř' => 'r',
        'ś' | 'š' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        'ß' => return Folded::Two('s', 's'),
        'æ' => return Folded::Two('a', 'e'),
        'œ' => return Folded::Two('o', 'e'),
        'ё' | 'є' => 'е',
        'щ' => 'ш',
        'і' | 'ї' => 'и',
        'ґ' => 'г',
        other => other,
    };
    Folded::One(f)
}

fn push_if_kept(out: &mut String, c: char) {
    if c.is_ascii_lowercase() || c.is_ascii_digit() || ('а'..='я').contains(&c) {
        out.push(c);
    }
}

/// Address of one bucket: `{search name}:{search original name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(String);

impl BucketKey {
    /// Wrap a key that was produced elsewhere (a peer, a file, an operator).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two halves of the key. A key without a separator is all name.
    pub fn parts(&self) -> (&str, &str) {
        self.0.split_once(':').unwrap_or((self.0.as_str(), ""))
    }

    /// A usable key has a separator and a non-empty name half.
    pub fn is_well_formed(&self) -> bool {
        matches!(self.0.find(':'), Some(idx) if idx > 0)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BucketKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
