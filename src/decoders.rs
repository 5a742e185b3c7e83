//! Decoder construction and per-topic caching.
//!
//! A [`DecoderFactory`] turns schema text into a [`Decoder`]; the
//! [`DecoderStore`] keeps one decoder per topic type and rebuilds it when the
//! schema hash reported by the source changes. Stale decoders are dropped
//! rather than reused, so a schema change mid-session never yields values
//! decoded under the old layout.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::Result;
use crate::types::ParsedValue;

/// Decodes raw payload bytes of one schema into the dynamic value form.
pub trait Decoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<ParsedValue>;
}

/// Builds decoders from schema text. Supplied by the embedding application,
/// which knows the serialization formats in play.
pub trait DecoderFactory: Send + Sync {
    fn make_decoder(&self, schema_name: &str, schema_text: &str) -> Result<Arc<dyn Decoder>>;
}

struct StoredDecoder {
    schema_hash: u64,
    decoder: Arc<dyn Decoder>,
}

/// Cache of constructed decoders keyed by schema name.
#[derive(Default)]
pub struct DecoderStore {
    inner: RwLock<HashMap<String, StoredDecoder>>,
}

impl DecoderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for `schema_name`, building one through `factory` on first use
    /// or whenever `schema_hash` differs from the cached entry's.
    pub fn get_decoder(
        &self,
        schema_name: &str,
        schema_hash: u64,
        schema_text: &str,
        factory: &dyn DecoderFactory,
    ) -> Result<Arc<dyn Decoder>> {
        {
            let inner = self.inner.read();
            if let Some(stored) = inner.get(schema_name) {
                if stored.schema_hash == schema_hash {
                    return Ok(stored.decoder.clone());
                }
            }
        }

        let decoder = factory.make_decoder(schema_name, schema_text)?;

        let mut inner = self.inner.write();
        match inner.get(schema_name) {
            // Another thread built a matching decoder while we were outside
            // the lock; keep theirs so every caller shares one instance.
            Some(stored) if stored.schema_hash == schema_hash => Ok(stored.decoder.clone()),
            _ => {
                debug!(schema = schema_name, hash = schema_hash, "decoder (re)built");
                inner.insert(
                    schema_name.to_string(),
                    StoredDecoder { schema_hash, decoder: decoder.clone() },
                );
                Ok(decoder)
            }
        }
    }

    /// Cached decoder for `schema_name`, if any. Does not build.
    pub fn get(&self, schema_name: &str) -> Option<Arc<dyn Decoder>> {
        self.inner.read().get(schema_name).map(|stored| stored.decoder.clone())
    }
}
