use std::hash::Hasher as StdHasher;
use std::sync::Arc;

use sha2::{Digest as _, Sha256, Sha512};
use twox_hash::XxHash64;

/// A digest produced by a [`Hasher`]. Compared byte-for-byte between the
/// reference pass and each worker's verification pass.
#[derive(Clone, PartialEq, Eq)]
pub struct Digest(Vec<u8>);

impl Digest {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// A resettable incremental hash engine.
///
/// Mirrors the host workspace's object-safety split for `async fn`-bearing
/// traits (`SpanExporter`/`SpanExporterBoxed`): here the trait itself is
/// already object-safe, so `Box<dyn Hasher>` is used directly without a
/// boxed-future adapter.
pub trait Hasher: Send {
    /// Extends the internal state with `bytes`.
    fn append(&mut self, bytes: &[u8]);

    /// Produces the current digest and resets internal state, making the
    /// instance ready to hash another stream.
    fn get_hash_and_reset(&mut self) -> Digest;

    /// Returns a fresh, equivalently-configured hasher. This is the trait
    /// object's stand-in for a `clone()` operation — `Self: Clone` isn't
    /// object-safe, so a fresh instance is produced instead of a copy of
    /// accumulated state (callers never need to clone in-flight state).
    fn fresh(&self) -> Box<dyn Hasher>;
}

/// A factory that produces hasher instances on demand. The coordinator
/// calls this once per worker during two-pass verification, and once more
/// for the reference hasher.
pub type HasherFactory = Arc<dyn Fn() -> Box<dyn Hasher> + Send + Sync>;

/// The two concrete hasher variants: a cryptographic algorithm of
/// configurable name, and a fast non-cryptographic 64-bit variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256, via the `sha2` crate.
    Sha256,
    /// SHA-512, via the `sha2` crate.
    Sha512,
    /// `XxHash64`, a fast non-cryptographic 64-bit hash.
    XxHash64,
}

impl HashAlgorithm {
    /// Builds a [`HasherFactory`] that produces fresh hashers of this
    /// algorithm on every call.
    #[must_use]
    pub fn factory(self) -> HasherFactory {
        Arc::new(move || self.create())
    }

    fn create(self) -> Box<dyn Hasher> {
        match self {
            HashAlgorithm::Sha256 => Box::new(Sha256Hasher::new()),
            HashAlgorithm::Sha512 => Box::new(Sha512Hasher::new()),
            HashAlgorithm::XxHash64 => Box::new(XxHash64Hasher::new()),
        }
    }
}

/// Cryptographic hasher backed by `sha2::Sha256`.
pub struct Sha256Hasher {
    state: Sha256,
}

impl Sha256Hasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Sha256::new(),
        }
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Sha256Hasher {
    fn append(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    fn get_hash_and_reset(&mut self) -> Digest {
        Digest(self.state.finalize_reset().to_vec())
    }

    fn fresh(&self) -> Box<dyn Hasher> {
        Box::new(Sha256Hasher::new())
    }
}

/// Cryptographic hasher backed by `sha2::Sha512`.
pub struct Sha512Hasher {
    state: Sha512,
}

impl Sha512Hasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Sha512::new(),
        }
    }
}

impl Default for Sha512Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Sha512Hasher {
    fn append(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    fn get_hash_and_reset(&mut self) -> Digest {
        Digest(self.state.finalize_reset().to_vec())
    }

    fn fresh(&self) -> Box<dyn Hasher> {
        Box::new(Sha512Hasher::new())
    }
}

/// Fast non-cryptographic 64-bit hasher backed by `twox_hash::XxHash64`.
pub struct XxHash64Hasher {
    state: XxHash64,
}

impl XxHash64Hasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: XxHash64::with_seed(0),
        }
    }
}

impl Default for XxHash64Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for XxHash64Hasher {
    fn append(&mut self, bytes: &[u8]) {
        self.state.write(bytes);
    }

    fn get_hash_and_reset(&mut self) -> Digest {
        let digest = self.state.finish().to_be_bytes().to_vec();
        self.state = XxHash64::with_seed(0);
        Digest(digest)
    }

    fn fresh(&self) -> Box<dyn Hasher> {
        Box::new(XxHash64Hasher::new())
    }
}
