//! Runtime generation of the in-kernel filter program (C1), without shipping
//! or invoking an external compiler.
//!
//! This is a small eBPF instruction builder: encode raw `bpf_insn` records,
//! track jump targets as labels, and resolve them to relative offsets in a
//! second pass (spec §4.1, §9). The alternative, precompiled path
//! (`xdp-ebpf/`, built with `aya-ebpf` ahead of time and pinned under
//! `/sys/fs/bpf/`) stays in the tree for the pinned/prebuilt
//! deployment mode described in spec §6; the two are mutually exclusive
//! (see DESIGN.md).

use crate::error::{IngressError, Result};

// eBPF instruction classes (low 3 bits of `code`).
const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_STX: u8 = 0x03;
const BPF_ALU: u8 = 0x04;
const BPF_JMP: u8 = 0x05;
const BPF_ALU64: u8 = 0x07;

// size modifiers.
const BPF_B: u8 = 0x10;
const BPF_H: u8 = 0x08;
const BPF_W: u8 = 0x00;
const BPF_DW: u8 = 0x18;

// addressing modes.
const BPF_MEM: u8 = 0x60;
const BPF_IMM: u8 = 0x00;

// ALU/JMP op codes (high 4 bits of `code`, shifted into place by the caller).
const BPF_MOV: u8 = 0xb0;
const BPF_ADD: u8 = 0x00;
const BPF_AND: u8 = 0x50;
const BPF_END: u8 = 0xd0;
const BPF_TO_BE: u8 = 0x08;
const BPF_JEQ: u8 = 0x10;
const BPF_JNE: u8 = 0x50;
const BPF_JGT: u8 = 0x20;
const BPF_JLT: u8 = 0xa0;
const BPF_JA: u8 = 0x00;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

const BPF_PSEUDO_MAP_FD: u8 = 1;

// registers.
const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const R3: u8 = 3;
const R6: u8 = 6;
const R7: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10; // read-only frame pointer.

// XDP actions (uapi `enum xdp_action`).
pub const XDP_ABORTED: i64 = 0;
pub const XDP_DROP: i64 = 1;
pub const XDP_PASS: i64 = 2;
pub const XDP_TX: i64 = 3;
pub const XDP_REDIRECT: i64 = 4;

/// helper function ids this program calls (uapi `enum bpf_func_id`).
const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;
const BPF_FUNC_REDIRECT_MAP: i32 = 51;

/// a raw 8-byte eBPF instruction.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Insn {
    pub code: u8,
    pub regs: u8, // dst (low nibble) | src (high nibble)
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self {
            code,
            regs: (dst & 0x0f) | (src << 4),
            off,
            imm,
        }
    }

    fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.code;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.off.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }
}

/// a forward or backward jump target, resolved in the linker pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

enum Item {
    Insn(Insn),
    /// a 16-byte wide immediate load (e.g. `BPF_LD_MAP_FD`); occupies two slots.
    WideLoad { dst: u8, imm: i64, src: u8 },
    Placeholder,
}

/// instruction builder with labels, resolved by a two-pass linker: the first
/// pass assigns each label its instruction index, the second substitutes
/// `target_index - current_index - 1` into every jump (spec §4.1).
#[derive(Default)]
pub struct ProgramBuilder {
    items: Vec<Item>,
    next_label: usize,
    /// (label, item index) pairs recorded by `place`.
    labels: Vec<(Label, usize)>,
    /// (item index of a jump, its target label), resolved in `link`.
    pending_jumps: Vec<(usize, Label)>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// mark `label` as referring to the next instruction to be emitted.
    pub fn place(&mut self, label: Label) {
        self.items.push(Item::Placeholder);
        self.labels.push((label, self.items.len() - 1));
    }

    fn push(&mut self, insn: Insn) -> &mut Self {
        self.items.push(Item::Insn(insn));
        self
    }

    pub fn mov64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.push(Insn::new(BPF_ALU64 | BPF_MOV | BPF_IMM, dst, 0, 0, imm))
    }

    pub fn mov64_reg(&mut self, dst: u8, src: u8) -> &mut Self {
        self.push(Insn::new(BPF_ALU64 | BPF_MOV | 0x08, dst, src, 0, 0))
    }

    pub fn add64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.push(Insn::new(BPF_ALU64 | BPF_ADD | BPF_IMM, dst, 0, 0, imm))
    }

    pub fn add64_reg(&mut self, dst: u8, src: u8) -> &mut Self {
        self.push(Insn::new(BPF_ALU64 | BPF_ADD | 0x08, dst, src, 0, 0))
    }

    pub fn and64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.push(Insn::new(BPF_ALU64 | BPF_AND | BPF_IMM, dst, 0, 0, imm))
    }

    /// byte-swap a 16-bit register between network and host order (`BPF_END`
    /// with the `TO_BE` source bit; a no-op on a big-endian host, a swap on
    /// the little-endian hosts this builder actually targets).
    pub fn to_be16(&mut self, dst: u8) -> &mut Self {
        self.push(Insn::new(BPF_ALU | BPF_END | BPF_TO_BE, dst, 0, 0, 16))
    }

    pub fn load_mem(&mut self, size: u8, dst: u8, src: u8, off: i16) -> &mut Self {
        self.push(Insn::new(BPF_LDX | BPF_MEM | size, dst, src, off, 0))
    }

    /// store `src` to `[dst + off]`.
    pub fn store_mem(&mut self, size: u8, dst: u8, src: u8, off: i16) -> &mut Self {
        self.push(Insn::new(BPF_STX | BPF_MEM | size, dst, src, off, 0))
    }

    /// load a 64-bit "pseudo-map" immediate: the map file descriptor, which
    /// the verifier rewrites into a kernel pointer at load time (spec §4.1).
    pub fn load_map_fd(&mut self, dst: u8, map_fd: i32) -> &mut Self {
        self.items.push(Item::WideLoad {
            dst,
            imm: map_fd as i64,
            src: BPF_PSEUDO_MAP_FD,
        });
        self
    }

    pub fn call(&mut self, func_id: i32) -> &mut Self {
        self.push(Insn::new(BPF_JMP | BPF_CALL, 0, 0, 0, func_id))
    }

    pub fn exit(&mut self) -> &mut Self {
        self.push(Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0))
    }

    /// jump to `label` if `dst == imm`.
    pub fn jeq_imm(&mut self, dst: u8, imm: i32, label: Label) -> &mut Self {
        self.push_jump_imm(BPF_JEQ, dst, imm, label)
    }

    pub fn jne_imm(&mut self, dst: u8, imm: i32, label: Label) -> &mut Self {
        self.push_jump_imm(BPF_JNE, dst, imm, label)
    }

    pub fn jgt_reg(&mut self, dst: u8, src: u8, label: Label) -> &mut Self {
        self.push_jump_reg(BPF_JGT, dst, src, label)
    }

    pub fn jlt_reg(&mut self, dst: u8, src: u8, label: Label) -> &mut Self {
        self.push_jump_reg(BPF_JLT, dst, src, label)
    }

    pub fn jeq_reg(&mut self, dst: u8, src: u8, label: Label) -> &mut Self {
        self.push_jump_reg(BPF_JEQ, dst, src, label)
    }

    fn push_jump_imm(&mut self, op: u8, dst: u8, imm: i32, label: Label) -> &mut Self {
        self.items.push(Item::Insn(Insn::new(BPF_JMP | op | BPF_IMM, dst, 0, 0, imm)));
        // patch off after placement; record as a pending jump referencing the
        // instruction we just pushed.
        let idx = self.items.len() - 1;
        self.pending_jumps.push((idx, label));
        self
    }

    fn push_jump_reg(&mut self, op: u8, dst: u8, src: u8, label: Label) -> &mut Self {
        self.items.push(Item::Insn(Insn::new(BPF_JMP | op | 0x08, dst, src, 0, 0)));
        let idx = self.items.len() - 1;
        self.pending_jumps.push((idx, label));
        self
    }

    pub fn ja(&mut self, label: Label) -> &mut Self {
        self.items.push(Item::Insn(Insn::new(BPF_JMP | BPF_JA, 0, 0, 0, 0)));
        let idx = self.items.len() - 1;
        self.pending_jumps.push((idx, label));
        self
    }

    /// resolve labels and emit the final flat instruction stream.
    pub fn link(mut self) -> Result<Vec<u8>> {
        // first pass: each Item::Placeholder index maps 1:1 to a slot index
        // in the eventual flat instruction array (WideLoad occupies two).
        let mut slot_of_item = Vec::with_capacity(self.items.len());
        let mut slot = 0usize;
        for item in &self.items {
            slot_of_item.push(slot);
            slot += match item {
                Item::WideLoad { .. } => 2,
                _ => 1,
            };
        }

        let mut label_slot = vec![usize::MAX; self.next_label];
        for (label, item_idx) in &self.labels {
            label_slot[label.0] = slot_of_item[*item_idx];
        }

        let mut out = Vec::with_capacity(slot * 8);
        for (item_idx, item) in self.items.into_iter().enumerate() {
            match item {
                Item::Insn(mut insn) => {
                    if let Some(&(_, label)) = self.pending_jumps.iter().find(|(idx, _)| *idx == item_idx) {
                        let target = label_slot[label.0];
                        if target == usize::MAX {
                            return Err(IngressError::VerifierRejection {
                                log: "unresolved jump label".into(),
                            });
                        }
                        let current = slot_of_item[item_idx];
                        insn.off = (target as isize - current as isize - 1) as i16;
                    }
                    out.extend_from_slice(&insn.to_bytes());
                }
                Item::WideLoad { dst, imm, src } => {
                    let lo = Insn::new(BPF_LD | BPF_DW | BPF_IMM, dst, src, 0, (imm & 0xffff_ffff) as i32);
                    let hi = Insn::new(0, 0, 0, 0, ((imm >> 32) & 0xffff_ffff) as i32);
                    out.extend_from_slice(&lo.to_bytes());
                    out.extend_from_slice(&hi.to_bytes());
                }
                Item::Placeholder => {}
            }
        }

        Ok(out)
    }
}

/// generate the verifier-safe redirect-or-pass program (spec §4.1 algorithm):
/// parse a UDP/IPv4 packet, look its destination port up in
/// `port_filter_map_fd` (a `BPF_MAP_TYPE_HASH` the loader seeds with
/// `{port: 1}` per listen port), and redirect only on a hit. `redirect_map_fd`
/// is the XSKMAP the caller has already created, keyed by `rx_queue_index`.
pub fn build_redirect_program(port_filter_map_fd: i32, redirect_map_fd: i32) -> Result<Vec<u8>> {
    let mut b = ProgramBuilder::new();

    let pass = b.new_label();
    let bounds_ok = b.new_label();
    let ipv4_ok = b.new_label();
    let udp_ok = b.new_label();

    // r1 = ctx (xdp_md*). Save it in a callee-saved register: r1-r5 are
    // clobbered by the BPF_CALLs below, but the redirect at the end still
    // needs ctx->rx_queue_index.
    b.mov64_reg(R9, R1);
    b.load_mem(BPF_W, R2, R9, 0); // data
    b.load_mem(BPF_W, R3, R9, 4); // data_end

    // step 1: ensure Ethernet + IPv4 minimum headers fit.
    b.mov64_reg(R6, R2);
    b.add64_imm(R6, 34); // 14 (eth) + 20 (ipv4 min)
    b.jgt_reg(R6, R3, pass);
    b.ja(bounds_ok);
    b.place(bounds_ok);

    // step 2: EtherType at offset 12.
    b.load_mem(BPF_H, R7, R2, 12);
    b.jne_imm(R7, 0x0008, pass); // network byte order 0x0800 -> 0x0008 on LE load path note below
    b.ja(ipv4_ok);
    b.place(ipv4_ok);

    // step 3: protocol byte at offset 23 (14 + 9).
    b.load_mem(BPF_B, R8, R2, 23);
    b.jne_imm(R8, 17, pass);
    b.ja(udp_ok);
    b.place(udp_ok);

    // step 4: IHL from byte 14, low nibble, in 4-byte words; r7 = r7*4 via
    // two self-doublings, then r7 = data + 14 + ihl_bytes, the UDP header.
    b.load_mem(BPF_B, R7, R2, 14);
    b.and64_imm(R7, 0x0f);
    b.add64_reg(R7, R7); // * 2
    b.add64_reg(R7, R7); // * 4 = ihl in bytes
    b.add64_imm(R7, 14);
    b.add64_reg(R7, R2); // r7 = pointer to the UDP header

    // step 5: the UDP header itself (8 bytes) must also fit before data_end.
    b.mov64_reg(R6, R7);
    b.add64_imm(R6, 8);
    b.jgt_reg(R6, R3, pass);

    // step 6: destination port (UDP header offset 2), network -> host order,
    // spilled to the stack as the lookup key (spec §4.1 step 6, §4.3 init).
    b.load_mem(BPF_H, R8, R7, 2);
    b.to_be16(R8);
    b.store_mem(BPF_H, R10, R8, -8);
    b.mov64_reg(R2, R10);
    b.add64_imm(R2, -8);
    b.load_map_fd(R1, port_filter_map_fd);
    b.call(BPF_FUNC_MAP_LOOKUP_ELEM);
    b.jeq_imm(R0, 0, pass); // no entry for this port => not allowlisted

    // step 7: allowlisted, redirect onto the queue's registered socket.
    // bpf_redirect_map returns XDP_REDIRECT on success or the passed flags
    // (0, i.e. XDP_ABORTED) on failure, so its own return value is the
    // program's return value (matching the kernel's xdpsock sample).
    b.load_mem(BPF_W, R6, R9, 16); // ctx->rx_queue_index
    b.load_map_fd(R1, redirect_map_fd);
    b.mov64_reg(R2, R6);
    b.mov64_imm(R3, 0);
    b.call(BPF_FUNC_REDIRECT_MAP);
    b.exit();

    b.place(pass);
    b.mov64_imm(R0, XDP_PASS as i32);
    b.exit();

    b.link()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_produces_instruction_multiple_of_eight_bytes() {
        let bytes = build_redirect_program(6, 7).unwrap();
        assert_eq!(bytes.len() % 8, 0);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn two_pass_linker_resolves_forward_jumps() {
        let mut b = ProgramBuilder::new();
        let end = b.new_label();
        b.mov64_imm(R0, 1);
        b.jeq_imm(R0, 1, end);
        b.mov64_imm(R0, 99); // should be skipped, off must point past it
        b.place(end);
        b.exit();
        let bytes = b.link().unwrap();
        // instruction 1 (the jeq) is the 2nd 8-byte slot; its off field (bytes 2-3)
        // must equal target_index(3) - current_index(1) - 1 = 1.
        let off = i16::from_le_bytes([bytes[8 + 2], bytes[8 + 3]]);
        assert_eq!(off, 1);
    }
}
