pub const DEFAULT_DATABASE_ID: &str = "(default)";
pub const DEFAULT_HOST: &str = "firestore.googleapis.com";
pub const EMULATOR_HOST_ENV: &str = "FIRESTORE_EMULATOR_HOST";
pub const FIRESTORE_COMPONENT_NAME: &str = "firestore";

/// Length of the random ids generated for new documents.
pub const AUTO_ID_LENGTH: usize = 20;
pub const AUTO_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
/// Disables LRU garbage collection when used as the cache size.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Maximum number of mutation batches in flight on the write stream.
pub const MAX_PENDING_WRITES: usize = 10;
