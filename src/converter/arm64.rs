//! ARM64 instruction helpers for the stub and selector fixers.
//!
//! Everything here works on raw little-endian instruction words;
//! nothing touches the cache. Signatures are checked by bit-mask
//! equality against the closed set of stub shapes the shared-cache
//! builder emits.

/// Sign-extends the low `bits` of `value`.
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return value as i64;
    }
    if value & (1u64 << (bits - 1)) != 0 {
        value as i64 - (1i64 << bits)
    } else {
        value as i64
    }
}

/// Reconstructs the page targeted by an ADRP at `addr`: the 33-bit
/// sign-extended immediate added to the instruction's own page.
pub fn adrp_page_target(adrp: u32, addr: u64) -> u64 {
    let immlo = u64::from(adrp & 0x6000_0000) >> 29;
    let immhi = u64::from(adrp & 0x00ff_ffe0) >> 3;
    let imm = sign_extend((immhi | immlo) << 12, 33);
    ((addr & !0xfff) as i64).wrapping_add(imm) as u64
}

/// Non-optimized stub: `ADRP x16; LDR x16, [x16, off]; BR x16`.
/// Returns the address of the pointer slot the LDR loads from.
pub fn stub_normal_ldr_addr(words: [u32; 3], addr: u64) -> Option<u64> {
    let [adrp, ldr, br] = words;
    if adrp & 0x9f00_001f != 0x9000_0010
        || ldr & 0xffc0_03ff != 0xf940_0210
        || br != 0xd61f_0200
    {
        return None;
    }

    let page = adrp_page_target(adrp, addr);
    let imm12 = u64::from(ldr & 0x003f_fc00) >> 7;
    Some(page + imm12)
}

/// Optimized stub: `ADRP x16; ADD x16, x16, off; BR x16`. Returns the
/// branch target the builder shortcut the stub to.
pub fn stub_optimized_target(words: [u32; 3], addr: u64) -> Option<u64> {
    let [adrp, add, br] = words;
    if adrp & 0x9f00_001f != 0x9000_0010
        || add & 0xffc0_03ff != 0x9100_0210
        || br != 0xd61f_0200
    {
        return None;
    }

    let page = adrp_page_target(adrp, addr);
    let imm12 = u64::from(add & 0x003f_fc00) >> 10;
    Some(page + imm12)
}

/// Non-optimized auth stub:
/// `ADRP x17; ADD x17, x17, off; LDR x16, [x17]; BRAA x16, x17`.
/// Returns the address of the pointer slot.
pub fn auth_stub_normal_ldr_addr(words: [u32; 4], addr: u64) -> Option<u64> {
    let [adrp, add, ldr, braa] = words;
    if adrp & 0x9f00_0000 != 0x9000_0000
        || add & 0xffc0_0000 != 0x9100_0000
        || ldr & 0xffc0_0000 != 0xf940_0000
        || braa & 0xfeff_f800 != 0xd61f_0800
    {
        return None;
    }

    let page = adrp_page_target(adrp, addr);
    let add_imm = u64::from(add & 0x003f_fc00) >> 10;
    let ldr_imm = u64::from(ldr & 0x003f_fc00) >> 7;
    Some(page + add_imm + ldr_imm)
}

/// Optimized auth stub: `ADRP x16; ADD x16, x16, off; BR x16; TRAP`.
pub fn auth_stub_optimized_target(words: [u32; 4], addr: u64) -> Option<u64> {
    let [adrp, add, br, trap] = words;
    if adrp & 0x9f00_0000 != 0x9000_0000
        || add & 0xffc0_0000 != 0x9100_0000
        || br != 0xd61f_0200
        || trap != 0xd420_0020
    {
        return None;
    }

    let page = adrp_page_target(adrp, addr);
    let imm12 = u64::from(add & 0x003f_fc00) >> 10;
    Some(page + imm12)
}

/// Auth-stub resolver: `ADRP x16; LDR x16, [x16, off]; BRAAZ x16`.
/// Returns the address of the resolver pointer slot.
pub fn auth_stub_resolver_ldr_addr(words: [u32; 3], addr: u64) -> Option<u64> {
    let [adrp, ldr, braaz] = words;
    if adrp & 0x9f00_0000 != 0x9000_0000
        || ldr & 0xffc0_0000 != 0xf940_0000
        || braaz & 0xfeff_f800 != 0xd61f_0800
    {
        return None;
    }

    let page = adrp_page_target(adrp, addr);
    let imm12 = u64::from(ldr & 0x003f_fc00) >> 7;
    Some(page + imm12)
}

/// Emits a normal stub whose LDR loads from `ldr_addr`.
pub fn generate_stub_normal(stub_addr: u64, ldr_addr: u64) -> [u8; 12] {
    // ADRP x16, lp@page
    let adrp_delta = (ldr_addr & !0xfff) as i64 - (stub_addr & !0xfff) as i64;
    let immhi = ((adrp_delta >> 9) as u32) & 0x00ff_ffe0;
    let immlo = ((adrp_delta << 17) as u32) & 0x6000_0000;
    let adrp = 0x9000_0010 | immlo | immhi;

    // LDR x16, [x16, lp@pageoff]
    let ldr_offset = ldr_addr & 0xfff;
    let imm12 = ((ldr_offset << 7) as u32) & 0x003f_fc00;
    let ldr = 0xf940_0210 | imm12;

    // BR x16
    let br = 0xd61f_0200u32;

    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&adrp.to_le_bytes());
    out[4..8].copy_from_slice(&ldr.to_le_bytes());
    out[8..12].copy_from_slice(&br.to_le_bytes());
    out
}

/// Emits a normal auth stub whose pointer slot is `ldr_addr`.
pub fn generate_auth_stub_normal(stub_addr: u64, ldr_addr: u64) -> [u8; 16] {
    // ADRP x17, sp@page
    let adrp_delta = (ldr_addr & !0xfff) as i64 - (stub_addr & !0xfff) as i64;
    let immhi = ((adrp_delta >> 9) as u32) & 0x00ff_ffe0;
    let immlo = ((adrp_delta << 17) as u32) & 0x6000_0000;
    let adrp = 0x9000_0011 | immlo | immhi;

    // ADD x17, x17, sp@pageoff
    let add_offset = ldr_addr & 0xfff;
    let imm12 = ((add_offset << 10) as u32) & 0x003f_fc00;
    let add = 0x9100_0231 | imm12;

    // LDR x16, [x17]
    let ldr = 0xf940_0230u32;

    // BRAA x16, x17
    let braa = 0xd71f_0a11u32;

    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&adrp.to_le_bytes());
    out[4..8].copy_from_slice(&add.to_le_bytes());
    out[8..12].copy_from_slice(&ldr.to_le_bytes());
    out[12..16].copy_from_slice(&braa.to_le_bytes());
    out
}

fn words_from(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adrp_immediate_is_sign_extended() {
        // ADRP x16, #0 at some page
        assert_eq!(adrp_page_target(0x9000_0010, 0x1_0000_0123), 0x1_0000_0000);

        let stub = generate_stub_normal(0x1_0000_0000, 0x0_f000_0000);
        let words = words_from(&stub);
        assert_eq!(
            stub_normal_ldr_addr([words[0], words[1], words[2]], 0x1_0000_0000),
            Some(0x0_f000_0000)
        );
    }

    // S4: an optimized stub rewritten as a normal stub targeting the
    // symbol pointer slot.
    #[test]
    fn optimized_stub_round_trips_through_normal_generation() {
        let stub_addr = 0x1_0000_8000u64;
        let pointer_slot = 0x1_0002_0000u64;

        let generated = generate_stub_normal(stub_addr, pointer_slot);
        let words = words_from(&generated);
        let words: [u32; 3] = [words[0], words[1], words[2]];

        // it is a well-formed normal stub pointing at the slot
        assert_eq!(stub_normal_ldr_addr(words, stub_addr), Some(pointer_slot));
        // and no longer matches the optimized shape
        assert_eq!(stub_optimized_target(words, stub_addr), None);
    }

    #[test]
    fn auth_stub_round_trip() {
        let stub_addr = 0x1_bfcb_5d20u64;
        let pointer_slot = 0x1_e27e_5348u64;

        let generated = generate_auth_stub_normal(stub_addr, pointer_slot);
        let words = words_from(&generated);
        let words: [u32; 4] = [words[0], words[1], words[2], words[3]];

        assert_eq!(auth_stub_normal_ldr_addr(words, stub_addr), Some(pointer_slot));
    }

    #[test]
    fn optimized_shapes_are_recognized() {
        // hand-built ADRP/ADD/BR pair targeting 0x1_0003_0000 from 0x1_0000_8000
        let adrp = 0x9000_0010u32 | {
            let delta = (0x1_0003_0000u64 & !0xfff) as i64 - (0x1_0000_8000u64 & !0xfff) as i64;
            (((delta >> 9) as u32) & 0x00ff_ffe0) | (((delta << 17) as u32) & 0x6000_0000)
        };
        let add = 0x9100_0210u32; // ADD x16, x16, #0
        let br = 0xd61f_0200u32;

        assert_eq!(
            stub_optimized_target([adrp, add, br], 0x1_0000_8000),
            Some(0x1_0003_0000)
        );
    }

    #[test]
    fn sign_extend_behaves_at_the_boundary() {
        assert_eq!(sign_extend(0x0fff_ffff, 28), -1);
        assert_eq!(sign_extend(0x07ff_ffff, 28), 0x07ff_ffff);
        assert_eq!(sign_extend(4, 28), 4);
        // full-width values pass through as two's complement
        assert_eq!(sign_extend(u64::MAX - 15, 64), -16);
    }
}
