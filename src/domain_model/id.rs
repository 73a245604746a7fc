use nanoid::nanoid;

/// 22 symbols from the 64-symbol URL-safe alphabet: 132 bits.
pub const TOKEN_ID_LEN: usize = 22;

pub trait TokenIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NanoidGenerator;

impl TokenIdGenerator for NanoidGenerator {
    fn next_id(&self) -> String {
        nanoid!(TOKEN_ID_LEN)
    }
}
