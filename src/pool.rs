//! Reusable buffers for serialization and key derivation

use parking_lot::{const_mutex, Mutex};

/// Buffers larger than this are dropped instead of pooled
pub const MAX_POOLED_BUFFER_CAPACITY: usize = 1 << 20;

/// Token vectors with more slots than this are dropped instead of pooled
pub const MAX_POOLED_TOKENS_CAPACITY: usize = 64;

const MAX_POOL_ENTRIES: usize = 64;

static BUFFERS: Mutex<Vec<Vec<u8>>> = const_mutex(Vec::new());
static KEY_TOKENS: Mutex<Vec<Vec<String>>> = const_mutex(Vec::new());

/// Take an empty byte buffer from the pool
pub fn get_buffer() -> Vec<u8> {
    BUFFERS.lock().pop().unwrap_or_default()
}

/// Return a byte buffer to the pool
pub fn put_buffer(mut buf: Vec<u8>) {
    if buf.capacity() > MAX_POOLED_BUFFER_CAPACITY {
        return;
    }
    buf.clear();
    let mut pool = BUFFERS.lock();
    if pool.len() < MAX_POOL_ENTRIES {
        pool.push(buf);
    }
}

/// Take an empty token vector from the pool
pub fn get_key_tokens() -> Vec<String> {
    KEY_TOKENS.lock().pop().unwrap_or_default()
}

/// Return a token vector to the pool
pub fn put_key_tokens(mut tokens: Vec<String>) {
    if tokens.capacity() > MAX_POOLED_TOKENS_CAPACITY {
        return;
    }
    tokens.clear();
    let mut pool = KEY_TOKENS.lock();
    if pool.len() < MAX_POOL_ENTRIES {
        pool.push(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_come_back_empty() {
        let mut buf = get_buffer();
        buf.extend_from_slice(b"payload");
        put_buffer(buf);
        assert!(get_buffer().is_empty());
    }

    #[test]
    fn test_oversized_items_are_discarded() {
        put_buffer(Vec::with_capacity(MAX_POOLED_BUFFER_CAPACITY + 1));
        put_key_tokens(Vec::with_capacity(MAX_POOLED_TOKENS_CAPACITY + 1));
        // other tests may share the pools, so only check what comes out
        assert!(get_buffer().capacity() <= MAX_POOLED_BUFFER_CAPACITY);
        assert!(get_key_tokens().capacity() <= MAX_POOLED_TOKENS_CAPACITY);
    }
}
