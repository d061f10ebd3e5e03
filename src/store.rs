mod fs;
mod memory;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::ArcStr;
use crate::error::StoreError;
use crate::param::Signature;
use crate::task::TaskInstance;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// The globally unique, restart-stable address of one persisted output:
/// (task kind name, parameter signature, output name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    kind: ArcStr,
    signature: Signature,
    output: ArcStr,
}

impl StoreKey {
    pub fn new(instance: &TaskInstance, output: &str) -> Self {
        Self {
            kind: instance.kind().into(),
            signature: instance.signature().clone(),
            output: output.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})#{}", self.kind, self.signature, self.output)
    }
}

/// An opaque payload produced by a run contract.
///
/// The engine and the stores treat artifacts as raw bytes; the
/// [`encode`](Artifact::encode) and [`decode`](Artifact::decode) helpers are a
/// convenience for callers whose payloads are serde values (CBOR on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Arc<[u8]>,
}

impl Artifact {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into().into(),
        }
    }

    pub fn encode<T: Serialize>(value: &T) -> Result<Self, StoreError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(ciborium::from_reader(self.bytes())?)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The completion store: persisted task outputs, addressed by [`StoreKey`].
///
/// A task instance counts as complete exactly when every one of its declared
/// outputs exists here; the engine never consults timestamps or content
/// hashes. Implementations must make `save` atomic per key and safe to call
/// concurrently for different keys.
pub trait Store: Send + Sync {
    fn exists(&self, key: &StoreKey) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::NotFound`] if the key is absent; absence is
    /// never reported as an empty artifact.
    fn load(&self, key: &StoreKey) -> Result<Artifact, StoreError>;

    /// Deterministic overwrite: saving the same key twice leaves the second
    /// artifact in place.
    fn save(&self, key: &StoreKey, artifact: &Artifact) -> Result<(), StoreError>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        (**self).exists(key)
    }

    fn load(&self, key: &StoreKey) -> Result<Artifact, StoreError> {
        (**self).load(key)
    }

    fn save(&self, key: &StoreKey, artifact: &Artifact) -> Result<(), StoreError> {
        (**self).save(key, artifact)
    }
}
