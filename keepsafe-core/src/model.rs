//! Record model shared by the client and server.

use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of payload carried by a [`DataItem`].
///
/// Wire codes are fixed; reordering the variants would break every
/// stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Free text.
    Text,
    /// A login/password pair ([`CredentialPayload`] as JSON).
    Credential,
    /// A binary file; `content` holds the original filename and the
    /// bytes live out-of-band in the blob store, addressed by id.
    Binary,
    /// Payment-card data ([`CardPayload`] as JSON).
    Card,
}

impl DataKind {
    /// Numeric code used on the wire and in the server table.
    pub fn code(self) -> i32 {
        match self {
            DataKind::Text => 0,
            DataKind::Credential => 1,
            DataKind::Binary => 2,
            DataKind::Card => 3,
        }
    }

    /// Parse a numeric wire code.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(DataKind::Text),
            1 => Ok(DataKind::Credential),
            2 => Ok(DataKind::Binary),
            3 => Ok(DataKind::Card),
            other => Err(Error::MalformedInput(format!(
                "unknown record kind code {other}"
            ))),
        }
    }

    /// Human-readable name for CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Text => "text",
            DataKind::Credential => "credential",
            DataKind::Binary => "binary",
            DataKind::Card => "card",
        }
    }
}

/// The unit of synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    /// Stable identifier, minted on the originating device.
    pub id: String,
    pub kind: DataKind,
    /// Payload; interpretation depends on `kind`.
    pub content: String,
    /// Free-form annotation supplied by the user.
    pub meta: String,
    /// Owning user; empty on a client copy until the server assigns it.
    #[serde(default)]
    pub user_id: String,
    /// Instant of the last mutation on any device, whole-second
    /// resolution on the wire.
    pub updated_at: DateTime<Utc>,
}

impl DataItem {
    /// Create a record stamped with the current time.
    pub fn new(id: String, kind: DataKind, content: String, meta: String) -> Self {
        Self {
            id,
            kind,
            content,
            meta,
            user_id: String::new(),
            updated_at: Utc::now().trunc_subsecs(0),
        }
    }

    /// File name of the local blob for a binary record: the record id
    /// plus the extension of the original filename held in `content`.
    pub fn blob_file_name(&self) -> String {
        format!("{}{}", self.id, extension_of(&self.content))
    }
}

/// Extension of a file name including the leading dot, or an empty
/// string when the name has none.
pub fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Format a timestamp at wire resolution (RFC3339, whole seconds, UTC).
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC3339 timestamp from the wire.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::MalformedInput(format!("bad timestamp {s:?}: {e}")))
}

/// Login/password pair stored as the content of a credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub login: String,
    pub password: String,
}

/// Payment card stored as the content of a card record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPayload {
    pub number: String,
    /// `MM/YY` or `MM/YYYY`.
    pub expiry: String,
    pub cvv: String,
    pub holder: String,
}

impl CardPayload {
    /// Validate the card fields before the record is stored.
    pub fn validate(&self) -> Result<()> {
        if !(13..=19).contains(&self.number.len())
            || !self.number.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(Error::MalformedInput(
                "invalid card number: must be 13 to 19 digits".into(),
            ));
        }

        let (month, year) = parse_expiry(&self.expiry)?;
        let now = Utc::now();
        // Valid through the end of the expiry month.
        if (year, month) < (now.year(), now.month() as i32) {
            return Err(Error::MalformedInput("card is expired".into()));
        }

        if !(3..=4).contains(&self.cvv.len()) || !self.cvv.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedInput(
                "invalid CVV: must be 3 or 4 digits".into(),
            ));
        }

        if self.holder.trim().is_empty() {
            return Err(Error::MalformedInput(
                "card holder name cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Parse `MM/YY` or `MM/YYYY` into (month, four-digit year).
fn parse_expiry(expiry: &str) -> Result<(i32, i32)> {
    let bad = || {
        Error::MalformedInput("expiration date must be in format MM/YY or MM/YYYY".into())
    };
    let (month_str, year_str) = expiry.split_once('/').ok_or_else(bad)?;
    if month_str.len() != 2 || !(year_str.len() == 2 || year_str.len() == 4) {
        return Err(bad());
    }
    let month: i32 = month_str.parse().map_err(|_| bad())?;
    let year: i32 = year_str.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) {
        return Err(bad());
    }
    let year = if year_str.len() == 2 { 2000 + year } else { year };
    Ok((month, year))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            DataKind::Text,
            DataKind::Credential,
            DataKind::Binary,
            DataKind::Card,
        ] {
            assert_eq!(DataKind::from_code(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_code_rejected() {
        assert!(matches!(
            DataKind::from_code(7),
            Err(crate::Error::MalformedInput(_))
        ));
    }

    #[test]
    fn extension_derivation() {
        assert_eq!(extension_of("report.pdf"), ".pdf");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("no-extension"), "");
        assert_eq!(extension_of(""), "");
    }

    #[test]
    fn blob_file_name_uses_content_extension() {
        let item = DataItem::new(
            "abc".into(),
            DataKind::Binary,
            "holiday photo.jpeg".into(),
            String::new(),
        );
        assert_eq!(item.blob_file_name(), "abc.jpeg");
    }

    #[test]
    fn timestamp_roundtrip_at_second_resolution() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let s = format_timestamp(t);
        assert_eq!(s, "2024-01-02T03:04:05Z");
        assert_eq!(parse_timestamp(&s).unwrap(), t);
    }

    #[test]
    fn bad_timestamp_is_malformed_input() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(crate::Error::MalformedInput(_))
        ));
    }

    #[test]
    fn new_items_have_no_owner_and_whole_second_stamp() {
        let item = DataItem::new("x".into(), DataKind::Text, "hi".into(), String::new());
        assert!(item.user_id.is_empty());
        assert_eq!(item.updated_at.timestamp_subsec_nanos(), 0);
    }

    fn card(number: &str, expiry: &str, cvv: &str, holder: &str) -> CardPayload {
        CardPayload {
            number: number.into(),
            expiry: expiry.into(),
            cvv: cvv.into(),
            holder: holder.into(),
        }
    }

    fn future_expiry() -> String {
        let next_year = Utc::now().year() + 1;
        format!("01/{next_year}")
    }

    #[test]
    fn valid_card_accepted() {
        assert!(card("1234567890123", &future_expiry(), "123", "John Doe")
            .validate()
            .is_ok());
    }

    #[test]
    fn short_card_number_rejected() {
        let err = card("123", &future_expiry(), "123", "John Doe")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("card number"));
    }

    #[test]
    fn bad_expiry_format_rejected() {
        let err = card("1234567890123", "13-2025", "123", "John Doe")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("expiration date"));
    }

    #[test]
    fn expired_card_rejected() {
        let err = card("1234567890123", "01/20", "123", "John Doe")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn two_digit_year_accepted() {
        let yy = (Utc::now().year() + 1) % 100;
        let expiry = format!("12/{yy:02}");
        assert!(card("1234567890123", &expiry, "1234", "Jane").validate().is_ok());
    }

    #[test]
    fn bad_cvv_rejected() {
        let err = card("1234567890123", &future_expiry(), "12", "John")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("CVV"));
    }

    #[test]
    fn empty_holder_rejected() {
        let err = card("1234567890123", &future_expiry(), "123", "  ")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("holder"));
    }
}
