//! Namespace-scoped page keys.
//!
//! A `PageKey` can only be built with a namespace, so every cache access is
//! scoped to one datastore's pages and a namespace flush never touches
//! another namespace.

use hoard_core::ModuleId;

/// Separator between the namespace and the module id. UTF-8 text never
/// contains 0xFF, so a namespace prefix cannot match a longer namespace.
const SEPARATOR: u8 = 0xFF;

/// Width of the encoded module id.
const MODULE_BYTES: usize = 8;

/// Cache key for one module page within a namespace.
///
/// # Binary Format
///
/// - namespace: UTF-8 bytes (variable length)
/// - separator: 0xFF
/// - module_id: 8 bytes, big-endian with the sign bit flipped
///
/// The module encoding preserves numeric order, so a namespace's pages sort
/// by module id and a prefix scan visits one namespace only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    namespace: String,
    module_id: ModuleId,
}

impl PageKey {
    pub fn new(namespace: &str, module_id: ModuleId) -> Self {
        Self {
            namespace: namespace.to_string(),
            module_id,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    /// Encode for storage: `[namespace][0xFF][module_id: 8 bytes]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.namespace.len() + 1 + MODULE_BYTES);
        bytes.extend_from_slice(self.namespace.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(&encode_module(self.module_id));
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the separator is missing or misplaced or the
    /// namespace is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 1 + MODULE_BYTES {
            return None;
        }
        let split = bytes.len() - MODULE_BYTES - 1;
        if bytes[split] != SEPARATOR {
            return None;
        }
        let namespace = std::str::from_utf8(&bytes[..split]).ok()?;
        let module: [u8; MODULE_BYTES] = bytes[split + 1..].try_into().ok()?;
        Some(Self {
            namespace: namespace.to_string(),
            module_id: decode_module(module),
        })
    }

    /// Prefix shared by every page key in a namespace.
    pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(namespace.len() + 1);
        prefix.extend_from_slice(namespace.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }
}

fn encode_module(module_id: ModuleId) -> [u8; MODULE_BYTES] {
    ((module_id as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_module(bytes: [u8; MODULE_BYTES]) -> ModuleId {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn namespace_strategy() -> impl Strategy<Value = String> {
        "[a-z0-9_.:-]{0,24}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        /// Property: Encode/decode roundtrip preserves the original value.
        #[test]
        fn prop_encode_decode_roundtrip(ns in namespace_strategy(), module in any::<i64>()) {
            let key = PageKey::new(&ns, module);
            prop_assert_eq!(PageKey::decode(&key.encode()), Some(key));
        }

        /// Property: Different keys never share an encoding.
        #[test]
        fn prop_encoding_is_injective(
            ns1 in namespace_strategy(),
            ns2 in namespace_strategy(),
            m1 in any::<i64>(),
            m2 in any::<i64>(),
        ) {
            let k1 = PageKey::new(&ns1, m1);
            let k2 = PageKey::new(&ns2, m2);
            if k1 == k2 {
                prop_assert_eq!(k1.encode(), k2.encode());
            } else {
                prop_assert_ne!(k1.encode(), k2.encode());
            }
        }

        /// Property: Byte order follows module order within a namespace.
        #[test]
        fn prop_module_order_preserved(ns in namespace_strategy(), m1 in any::<i64>(), m2 in any::<i64>()) {
            let e1 = PageKey::new(&ns, m1).encode();
            let e2 = PageKey::new(&ns, m2).encode();
            prop_assert_eq!(m1.cmp(&m2), e1.cmp(&e2));
        }

        /// Property: The namespace prefix is a prefix of every key in it.
        #[test]
        fn prop_namespace_prefix_is_prefix(ns in namespace_strategy(), module in any::<i64>()) {
            let encoded = PageKey::new(&ns, module).encode();
            let prefix = PageKey::namespace_prefix(&ns);
            prop_assert!(encoded.starts_with(&prefix));
        }
    }
}
