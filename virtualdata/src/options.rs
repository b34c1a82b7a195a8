use std::sync::Arc;

/// Host hook fired when the engine has queued commands or events and is not
/// already inside a host call. Lets hosts integrate with any scheduler: the
/// usual reaction is "drain commands and events soon".
pub type WakeCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for [`crate::ListEngine`].
///
/// Cheap to clone; construct with [`ListOptions::new`] and the `with_*`
/// builders.
pub struct ListOptions {
    /// Unretained slots the background trim leaves cached.
    pub cache_size: usize,
    /// Default number of surrounding items asked for per fetch, on each side
    /// of the anchor.
    pub fetch_chunk: usize,
    /// Mirages tolerated since the last refresh before one is scheduled.
    pub mirage_tolerance: u32,
    /// Refresh attempts before the cycle breaker starts looking for a
    /// repeating trigger pattern.
    pub refresh_attempt_limit: u32,
    /// Rolling history length for the refresh cycle breaker.
    pub refresh_history_len: usize,
    /// Optional host wake hook.
    pub on_wake: Option<WakeCallback>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self {
            cache_size: 200,
            fetch_chunk: 10,
            mirage_tolerance: 3,
            refresh_attempt_limit: 12,
            refresh_history_len: 16,
            on_wake: None,
        }
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_fetch_chunk(mut self, fetch_chunk: usize) -> Self {
        self.fetch_chunk = fetch_chunk.max(1);
        self
    }

    pub fn with_mirage_tolerance(mut self, mirage_tolerance: u32) -> Self {
        self.mirage_tolerance = mirage_tolerance;
        self
    }

    pub fn with_refresh_attempt_limit(mut self, refresh_attempt_limit: u32) -> Self {
        self.refresh_attempt_limit = refresh_attempt_limit;
        self
    }

    pub fn with_refresh_history_len(mut self, refresh_history_len: usize) -> Self {
        self.refresh_history_len = refresh_history_len;
        self
    }

    pub fn with_on_wake(mut self, on_wake: Option<impl Fn() + Send + Sync + 'static>) -> Self {
        self.on_wake = on_wake.map(|f| Arc::new(f) as _);
        self
    }
}

impl Default for ListOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ListOptions {
    fn clone(&self) -> Self {
        Self {
            cache_size: self.cache_size,
            fetch_chunk: self.fetch_chunk,
            mirage_tolerance: self.mirage_tolerance,
            refresh_attempt_limit: self.refresh_attempt_limit,
            refresh_history_len: self.refresh_history_len,
            on_wake: self.on_wake.clone(),
        }
    }
}

impl core::fmt::Debug for ListOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListOptions")
            .field("cache_size", &self.cache_size)
            .field("fetch_chunk", &self.fetch_chunk)
            .field("mirage_tolerance", &self.mirage_tolerance)
            .field("refresh_attempt_limit", &self.refresh_attempt_limit)
            .field("refresh_history_len", &self.refresh_history_len)
            .finish_non_exhaustive()
    }
}
