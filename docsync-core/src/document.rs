//! The canonical document record and its wire encoding.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Unsigned timestamp as carried on the wire and in storage.
pub type Timestamp = u64;

/// The unit of record, keyed by `url`.
///
/// Wire form is a JSON object with camelCase field names. Decoding also
/// accepts the capitalised names produced by untagged serialisers, and
/// treats absent timestamps as zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(alias = "Url")]
    pub url: String,

    #[serde(default, alias = "PubDate")]
    pub pub_date: Timestamp,

    #[serde(default, alias = "FetchTime")]
    pub fetch_time: Timestamp,

    #[serde(default, alias = "Text")]
    pub text: String,

    #[serde(default, alias = "FirstFetchTime")]
    pub first_fetch_time: Timestamp,
}

impl Document {
    /// Create a document whose first fetch is this fetch.
    pub fn new(
        url: impl Into<String>,
        text: impl Into<String>,
        fetch_time: Timestamp,
        pub_date: Timestamp,
    ) -> Self {
        Self {
            url: url.into(),
            pub_date,
            fetch_time,
            text: text.into(),
            first_fetch_time: fetch_time,
        }
    }

    /// Override the first fetch time.
    pub fn with_first_fetch_time(mut self, first_fetch_time: Timestamp) -> Self {
        self.first_fetch_time = first_fetch_time;
        self
    }

    /// Encode to the wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode {
            reason: e.to_string(),
        })
    }

    /// Decode from the wire form, rejecting documents without a url.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
        let doc: Document = serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })?;
        doc.validate()?;
        Ok(doc)
    }

    /// Check the fields a document must carry to be reconciled.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.url.trim().is_empty() {
            return Err(CodecError::InvalidField {
                field: "url".to_string(),
                reason: "url must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
