//! Electrum scripthash: the SHA-256 of a locking script, byte-reversed.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::DisplayHex;
use bitcoin::Script;

/// Key Electrum servers index history by. Displays as 64 lowercase hex
/// characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHash([u8; 32]);

impl ScriptHash {
    pub fn to_byte_array(self) -> [u8; 32] {
        self.0
    }
}

impl std::fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hex())
    }
}

/// Total over any script, including the empty one.
pub fn script_hash(script: &Script) -> ScriptHash {
    let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    bytes.reverse();
    ScriptHash(bytes)
}
