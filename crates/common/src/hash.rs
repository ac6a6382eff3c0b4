//! FNV-1a hashing used for class ids and scene path keys.

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0100_0000_01b3;

/// 32-bit FNV-1a over raw bytes.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV32_PRIME)
    })
}

/// 64-bit FNV-1a over raw bytes.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(FNV64_OFFSET, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV64_PRIME)
    })
}

/// Key used by the world's scene instance registry.
///
/// Separators are normalized so `a\b.json` and `a/b.json` name the same scene.
pub fn path_hash(path: &str) -> u64 {
    let normalized = path.replace('\\', "/");
    fnv1a_64(normalized.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv32_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn fnv64_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn path_hash_ignores_separator_style() {
        assert_eq!(path_hash("levels\\intro.json"), path_hash("levels/intro.json"));
        assert_ne!(path_hash("levels/intro.json"), path_hash("levels/outro.json"));
    }
}
