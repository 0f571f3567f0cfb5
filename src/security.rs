//! Security access (C7): seed/key challenge-response for unlocking
//! privileged ECU operations, invoked from [`crate::kwp2000`] when a session
//! performs a `securityAccess` request sequence.

use crate::error::SecurityAccessError;

/// A seed/key algorithm: given the seed the ECU returned and an ECU
/// identification index, compute the key to send back.
pub trait SeedKeyAlgorithm {
    /// Compute the key for `seed`, indexed by `ecu_id_index` (normally the
    /// bytewise sum of the ECU's hardware-identification block, mod 64).
    fn compute_key(&self, seed: u32, ecu_id_index: u8) -> Result<u32, SecurityAccessError>;
}

/// The KWP2000 XOR-rotate challenge (security levels below the read-only
/// shortcut), ported from a published KWP2000 implementation.
///
/// For 5 iterations, `seed` rotates left by 1 bit; if the pre-rotation high
/// bit was set, the rotated value is XORed against `SEED_DATA[ecu_id_index]`.
pub struct XorRotateKey;

impl XorRotateKey {
    /// Prekey added to the seed for the read-only (level 4) shortcut.
    const READ_ONLY_PREKEY: u32 = 0x0001_1170;

    /// The 64-entry table indexed by `ecu_id_index`, reproduced bit-exact.
    #[rustfmt::skip]
    const SEED_DATA: [u32; 64] = [
        0x0A221289, 0x144890A1, 0x24212491, 0x290A0285,
        0x42145091, 0x504822C1, 0x0A24C4C1, 0x14252229,
        0x24250525, 0x2510A491, 0x28488863, 0x29148885,
        0x422184A5, 0x49128521, 0x50844A85, 0x620CC211,
        0x124452A9, 0x18932251, 0x2424A459, 0x29149521,
        0x42352621, 0x4A512289, 0x52A48911, 0x11891475,
        0x22346523, 0x4A3118D1, 0x64497111, 0x0AE34529,
        0x15398989, 0x22324A67, 0x2D12B489, 0x132A4A75,
        0x19B13469, 0x25D2C453, 0x4949349B, 0x524E9259,
        0x1964CA6B, 0x24F5249B, 0x28979175, 0x352A5959,
        0x3A391749, 0x51D44EA9, 0x564A4F25, 0x6AD52649,
        0x76493925, 0x25DE52C9, 0x332E9333, 0x68D64997,
        0x494947FB, 0x33749ACF, 0x5AD55B5D, 0x7F272A4F,
        0x35BD5B75, 0x3F5AD55D, 0x5B5B6DAD, 0x6B5DAD6B,
        0x75B57AD5, 0x5DBAD56F, 0x6DBF6AAD, 0x75775EB5,
        0x5AEDFED5, 0x6B5F7DD5, 0x6F757B6B, 0x5FBD5DBD,
    ];

    /// The read-only level-4 shortcut: no table lookup, just an add.
    pub fn read_only_key(seed: u32) -> u32 {
        seed.wrapping_add(Self::READ_ONLY_PREKEY)
    }
}

impl SeedKeyAlgorithm for XorRotateKey {
    fn compute_key(&self, seed: u32, ecu_id_index: u8) -> Result<u32, SecurityAccessError> {
        let table_index = (ecu_id_index as usize) % Self::SEED_DATA.len();
        let mut seed = seed;
        for _ in 0..5 {
            let high_bit_set = seed & 0x8000_0000 != 0;
            let rotated = seed.rotate_left(1);
            seed = if high_bit_set {
                Self::SEED_DATA[table_index] ^ rotated
            } else {
                rotated
            };
        }
        Ok(seed)
    }
}

/// The UDS SA2 bytecode variant: an ECU-supplied bytecode program executed
/// over the seed to produce a key. The bytecode interpreter itself is a
/// separate, unrelated black box; this stack only needs to honor the
/// seed/key contract, so it is left unimplemented rather than guessed at.
pub struct Sa2Bytecode;

impl SeedKeyAlgorithm for Sa2Bytecode {
    fn compute_key(&self, _seed: u32, _ecu_id_index: u8) -> Result<u32, SecurityAccessError> {
        Err(SecurityAccessError::BytecodeUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_shortcut_matches_spec_example() {
        // S4: seed 0x12345678 -> key 0x123567E8
        assert_eq!(XorRotateKey::read_only_key(0x1234_5678), 0x1235_67E8);
    }

    #[test]
    fn xor_rotate_is_deterministic_for_a_given_ecu_index() {
        let algo = XorRotateKey;
        let a = algo.compute_key(0x1111_1111, 0).unwrap();
        let b = algo.compute_key(0x1111_1111, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn xor_rotate_varies_with_ecu_index() {
        let algo = XorRotateKey;
        let a = algo.compute_key(0xFFFF_FFFF, 0).unwrap();
        let b = algo.compute_key(0xFFFF_FFFF, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ecu_index_wraps_into_table_range() {
        let algo = XorRotateKey;
        // index 64 must not panic; it wraps to 0.
        assert_eq!(
            algo.compute_key(0xABCD_1234, 64).unwrap(),
            algo.compute_key(0xABCD_1234, 0).unwrap()
        );
    }

    #[test]
    fn sa2_bytecode_is_a_stub() {
        let algo = Sa2Bytecode;
        assert!(matches!(
            algo.compute_key(0, 0),
            Err(SecurityAccessError::BytecodeUnsupported)
        ));
    }
}
