use aliri_braid::braid;
use std::fmt;

/// Redacts a secret braid unless formatted with `#`
///
/// `{:#?}` shows a prefix of `$reveal` characters, or the requested width;
/// `{:#}` shows the whole value unless a width is given.
macro_rules! redacted {
    ($ty:ty, $label:literal, reveal = $reveal:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                f.write_str("\"")?;
                write_prefix(self.as_str(), f, $reveal)?;
                f.write_str("\"")
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                write_prefix(self.as_str(), f, usize::MAX)
            }
        }
    };
}

/// Writes at most `width - 1` characters of `value`, marking a cut with `…`
fn write_prefix(value: &str, f: &mut fmt::Formatter, default_width: usize) -> fmt::Result {
    let keep = f.width().unwrap_or(default_width).saturating_sub(1);
    if keep == 0 {
        return f.write_str("…");
    }

    match value.char_indices().nth(keep) {
        Some((cut, _)) => {
            f.write_str(&value[..cut])?;
            f.write_str("…")
        }
        None => f.write_str(value),
    }
}

/// The application key issued when an application is registered
#[braid(serde)]
pub struct AppKey;

/// The application secret paired with an [`AppKey`]
#[braid(serde, debug = "owned", display = "owned")]
pub struct AppSecret;

redacted!(AppSecretRef, "APP SECRET", reveal = 5);

/// An access token issued by the APIM token service
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, "ACCESS TOKEN", reveal = 15);
