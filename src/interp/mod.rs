//! Abstract interpretation of decoded x86-32 functions. One linear pass
//! tracks registers that point at the entity structure, scalar register
//! constants, XMM scalar constants, and the FPU stack top, and emits the
//! default-field writes and spawnflag operations it can prove.

pub mod decode;
pub mod insn;

pub use insn::{Insn, MemRef, Op, Operand, Reg, Width};

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::listing::FieldDescriptor;
use crate::manifest::{DefaultMap, DefaultValue, SpawnEvidence, Value};
use crate::pe::PeImage;

/// Longest byte window decoded for a single function
pub const MAX_FUNCTION_WINDOW: u32 = 0x400;
/// Offset of the spawnflags field inside the entity structure
pub const SPAWNFLAGS_OFFSET: i32 = 0x11C;
/// Instruction index limit for treating a stack-slot load as the incoming
/// entity pointer
const EARLY_FRAME_WINDOW: usize = 80;
/// Field offsets below this bound always use synthetic names
const NAMED_FIELD_FLOOR: u32 = 0x100;

/// Decode the instruction stream of `[start, stop)` from the image
pub fn disassemble(pe: &PeImage, start: u32, stop: u32) -> Vec<Insn> {
    let length = stop.saturating_sub(start) as usize;
    if length == 0 {
        return Vec::new();
    }
    let Some(bytes) = pe.read_range(start, length) else {
        return Vec::new();
    };
    decode::decode_all(bytes, start)
}

#[derive(Debug, Default)]
/// Everything the interpreter proved about one function
pub struct Effects {
    /// Spawnflag bitmask evidence
    pub spawnflags: SpawnEvidence,
    /// Default-field writes grouped by field name
    pub defaults: DefaultMap,
}

#[derive(Debug, Clone, Copy)]
struct XmmConst {
    value: Option<f64>,
    bits: Option<u64>,
    width: Width,
}

impl XmmConst {
    fn float_value(&self) -> Option<f64> {
        if self.value.is_some() {
            return self.value;
        }
        let bits = self.bits?;
        Some(match self.width {
            Width::Qword => f64::from_bits(bits),
            _ => f32::from_bits(bits as u32) as f64,
        })
    }
}

struct Machine<'a> {
    pe: Option<&'a PeImage>,
    fields: &'a BTreeMap<u32, FieldDescriptor>,
    self_bases: HashMap<Reg, i64>,
    reg_constants: HashMap<Reg, u32>,
    xmm: HashMap<u8, XmmConst>,
    fpu: Vec<Option<f64>>,
    sf_regs: HashSet<Reg>,
    effects: Effects,
}

fn is_sf_mem(operand: &Operand) -> bool {
    match operand {
        Operand::Mem(mem) => {
            mem.disp == SPAWNFLAGS_OFFSET && (mem.base.is_some() || mem.index.is_some())
        }
        _ => false,
    }
}

impl<'a> Machine<'a> {
    fn new(pe: Option<&'a PeImage>, fields: &'a BTreeMap<u32, FieldDescriptor>) -> Self {
        Self {
            pe,
            fields,
            self_bases: HashMap::new(),
            reg_constants: HashMap::new(),
            xmm: HashMap::new(),
            fpu: Vec::new(),
            sf_regs: HashSet::new(),
            effects: Effects::default(),
        }
    }

    fn reset(&mut self) {
        self.self_bases.clear();
        self.reg_constants.clear();
        self.xmm.clear();
        self.fpu.clear();
        self.sf_regs.clear();
    }

    fn call_clobber(&mut self) {
        for reg in [Reg::Eax, Reg::Ecx, Reg::Edx] {
            self.self_bases.remove(&reg);
            self.reg_constants.remove(&reg);
            self.sf_regs.remove(&reg);
        }
        self.xmm.clear();
        self.fpu.clear();
    }

    /// Any memory operand that references the spawnflags offset marks its
    /// base register as pointing at the entity, unless the index register
    /// holds a known nonzero value.
    fn seed_self_bases(&mut self, insn: &Insn) {
        for operand in &insn.operands {
            let Operand::Mem(mem) = operand else { continue };
            let Some(base) = mem.base else { continue };
            if mem.disp != SPAWNFLAGS_OFFSET {
                continue;
            }
            if let Some(index) = mem.index {
                if self.reg_constants.get(&index).copied().unwrap_or(0) != 0 {
                    continue;
                }
            }
            self.self_bases.entry(base).or_insert(0);
        }
    }

    /// Offset of a memory operand into the entity structure, when its base
    /// register is a known self-base and the index (if any) is constant
    fn self_offset(&self, mem: &MemRef) -> Option<i64> {
        let base = mem.base?;
        let mut offset = *self.self_bases.get(&base)? + mem.disp as i64;
        if let Some(index) = mem.index {
            let value = *self.reg_constants.get(&index)?;
            offset += value as i64 * mem.scale as i64;
        }
        Some(offset)
    }

    /// Absolute address of a memory operand, when every referenced register
    /// holds a known constant
    fn mem_address(&self, mem: &MemRef) -> Option<u32> {
        let mut address = mem.disp as i64;
        if let Some(base) = mem.base {
            address += *self.reg_constants.get(&base)? as i64;
        }
        if let Some(index) = mem.index {
            address += *self.reg_constants.get(&index)? as i64 * mem.scale as i64;
        }
        u32::try_from(address).ok()
    }

    fn record_int(&mut self, offset: i64, raw: i64, mask: u32) {
        if offset < 0 {
            return;
        }
        let offset = offset as u32;
        let field = self.fields.get(&offset);
        let name = match field {
            Some(descriptor) if offset >= NAMED_FIELD_FLOOR => descriptor.name.clone(),
            _ => format!("offset_0x{offset:x}"),
        };
        let masked = (raw as u32) & mask;
        let value = if field.map(FieldDescriptor::is_float).unwrap_or(false) {
            Value::Float(f32::from_bits(masked) as f64)
        } else if mask == 0xFFFF_FFFF && masked & 0x8000_0000 != 0 {
            Value::Int(masked as i64 - 0x1_0000_0000)
        } else {
            Value::Int(masked as i64)
        };
        self.effects
            .defaults
            .entry(name)
            .or_default()
            .push(DefaultValue { offset, value });
    }

    fn record_float(&mut self, offset: i64, value: f64) {
        if offset < 0 {
            return;
        }
        let offset = offset as u32;
        let name = match self.fields.get(&offset) {
            Some(descriptor) if offset >= NAMED_FIELD_FLOOR => descriptor.name.clone(),
            _ => format!("offset_0x{offset:x}"),
        };
        self.effects
            .defaults
            .entry(name)
            .or_default()
            .push(DefaultValue {
                offset,
                value: Value::Float(value),
            });
    }

    fn set_xmm(&mut self, reg: u8, value: Option<f64>, bits: Option<u64>, width: Width) {
        self.xmm.insert(reg, XmmConst { value, bits, width });
    }

    fn set_xmm_scalar(&mut self, reg: u8, value: f64, width: Width) {
        let bits = match width {
            Width::Qword => value.to_bits(),
            _ => (value as f32).to_bits() as u64,
        };
        self.set_xmm(reg, Some(value), Some(bits), width);
    }

    fn copy_xmm(&mut self, dst: u8, src: u8) {
        match self.xmm.get(&src).copied() {
            Some(constant) => {
                self.xmm.insert(dst, constant);
            }
            None => {
                self.xmm.remove(&dst);
            }
        }
    }

    fn xmm_float(&self, reg: u8) -> Option<f64> {
        self.xmm.get(&reg).and_then(XmmConst::float_value)
    }

    /// Spawnflag evidence rules
    fn sf_step(&mut self, insn: &Insn) {
        let ops = &insn.operands;
        let dst = ops.first().copied();
        let src = ops.get(1).copied();
        let width_mask = insn.width.mask();

        if insn.op.is_mov_family() && ops.len() >= 2 {
            if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                if src.as_ref().map(is_sf_mem).unwrap_or(false) {
                    self.sf_regs.insert(d);
                } else if src
                    .as_ref()
                    .and_then(Operand::gpr)
                    .map(|s| self.sf_regs.contains(&s))
                    .unwrap_or(false)
                {
                    self.sf_regs.insert(d);
                } else {
                    self.sf_regs.remove(&d);
                }
            }
            if dst.as_ref().map(is_sf_mem).unwrap_or(false) {
                if let Some(imm) = src.as_ref().and_then(Operand::imm) {
                    let mask = (imm as u32) & width_mask;
                    if mask != 0 {
                        self.effects.spawnflags.assignments.insert(mask);
                    }
                }
            }
        }

        if insn.op == Op::Test && ops.len() >= 2 {
            let imm = ops.iter().find_map(Operand::imm);
            let target = ops.iter().find(|o| o.imm().is_none());
            if let (Some(imm), Some(target)) = (imm, target) {
                let mask = (imm as u32) & width_mask;
                if mask != 0 {
                    let reg_holds_flags = target
                        .gpr()
                        .map(|r| self.sf_regs.contains(&r))
                        .unwrap_or(false);
                    if reg_holds_flags || is_sf_mem(target) {
                        self.effects.spawnflags.checks.insert(mask);
                    }
                }
            }
        }

        if matches!(insn.op, Op::And | Op::Or) && ops.len() >= 2 {
            if let Some(imm) = src.as_ref().and_then(Operand::imm) {
                let mask = (imm as u32) & width_mask;
                if mask != 0 {
                    if dst.as_ref().map(is_sf_mem).unwrap_or(false) {
                        if insn.op == Op::Or {
                            self.effects.spawnflags.sets.insert(mask);
                        } else {
                            self.effects.spawnflags.record_clear(mask, width_mask);
                        }
                    } else if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                        if self.sf_regs.contains(&d) && insn.op == Op::And {
                            self.effects.spawnflags.checks.insert(mask);
                        }
                    }
                }
            }
        }

        if insn.op.writes_gpr_dst() && !insn.op.is_mov_family() {
            if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                self.sf_regs.remove(&d);
            }
        }
    }

    /// Register, XMM, FPU, and default-write rules
    fn state_step(&mut self, idx: usize, insn: &Insn) {
        let ops = &insn.operands;
        let dst = ops.first().copied();
        let src = ops.get(1).copied();

        if ops.iter().any(|o| matches!(o, Operand::Xmm(_))) {
            self.xmm_step(insn);
            return;
        }

        match insn.op {
            Op::Fld1 => {
                self.fpu.push(Some(1.0));
                return;
            }
            Op::Fldz => {
                self.fpu.push(Some(0.0));
                return;
            }
            Op::Fld => {
                let value = dst
                    .as_ref()
                    .and_then(Operand::mem)
                    .and_then(|mem| self.mem_address(&mem))
                    .and_then(|address| self.read_scalar(address, insn.width));
                self.fpu.push(value);
                return;
            }
            Op::Fst | Op::Fstp => {
                let value = if insn.op == Op::Fstp {
                    self.fpu.pop().flatten()
                } else {
                    self.fpu.last().copied().flatten()
                };
                let offset = dst
                    .as_ref()
                    .and_then(Operand::mem)
                    .and_then(|mem| self.self_offset(&mem));
                if let (Some(offset), Some(value)) = (offset, value) {
                    self.record_float(offset, value);
                }
                return;
            }
            _ => {}
        }

        // Self-xor and self-sub are the idiomatic register zeroings.
        if matches!(insn.op, Op::Xor | Op::Sub) && ops.len() >= 2 {
            let d = dst.as_ref().and_then(Operand::gpr);
            let s = src.as_ref().and_then(Operand::gpr);
            if let (Some(d), Some(s)) = (d, s) {
                if d == s {
                    self.self_bases.remove(&d);
                    self.reg_constants.insert(d, 0);
                    return;
                }
            }
        }

        if matches!(insn.op, Op::Add | Op::Sub) && ops.len() >= 2 {
            if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                let magnitude = src.as_ref().and_then(Operand::imm).or_else(|| {
                    src.as_ref()
                        .and_then(Operand::gpr)
                        .and_then(|s| self.reg_constants.get(&s).copied())
                        .map(i64::from)
                });
                let delta = magnitude.map(|m| if insn.op == Op::Sub { -m } else { m });
                if let Some(delta) = delta {
                    if let Some(base) = self.self_bases.get_mut(&d) {
                        *base += delta;
                    }
                    if let Some(constant) = self.reg_constants.get_mut(&d) {
                        *constant =
                            ((*constant as i64 + delta) as u32) & insn.width.mask();
                    }
                    return;
                }
                if self.self_bases.contains_key(&d) || self.reg_constants.contains_key(&d) {
                    self.self_bases.remove(&d);
                    self.reg_constants.remove(&d);
                    return;
                }
            }
        }

        if insn.op.is_mov_family() && ops.len() >= 2 {
            if let Some(mem) = dst.as_ref().and_then(Operand::mem) {
                if let Some(offset) = self.self_offset(&mem) {
                    let value = src.as_ref().and_then(Operand::imm).or_else(|| {
                        src.as_ref()
                            .and_then(Operand::gpr)
                            .and_then(|s| self.reg_constants.get(&s).copied())
                            .map(i64::from)
                    });
                    if let Some(value) = value {
                        self.record_int(offset, value, insn.width.mask());
                    }
                }
            }

            if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                let src_reg = src.as_ref().and_then(Operand::gpr);
                let src_mem = src.as_ref().and_then(Operand::mem);
                if let Some(base) = src_reg.and_then(|s| self.self_bases.get(&s).copied()) {
                    self.self_bases.insert(d, base);
                } else if let Some(mem) = src_mem
                    .filter(|m| m.index.is_none())
                    .filter(|m| matches!(m.base, Some(Reg::Ebp) | Some(Reg::Esp)))
                {
                    // The entity pointer arrives through the frame: either a
                    // named argument slot or an early raw stack slot.
                    let from_frame = match mem.base {
                        Some(Reg::Ebp) => mem.disp >= 8,
                        Some(Reg::Esp) => {
                            idx <= EARLY_FRAME_WINDOW && (4..=0x80).contains(&mem.disp)
                        }
                        _ => false,
                    };
                    if from_frame {
                        self.self_bases.insert(d, 0);
                    } else {
                        self.self_bases.remove(&d);
                    }
                } else {
                    self.self_bases.remove(&d);
                }

                if let Some(imm) = src.as_ref().and_then(Operand::imm) {
                    self.reg_constants
                        .insert(d, (imm as u32) & insn.width.mask());
                } else if let Some(constant) =
                    src_reg.and_then(|s| self.reg_constants.get(&s).copied())
                {
                    self.reg_constants.insert(d, constant);
                } else {
                    self.reg_constants.remove(&d);
                }
            }
            return;
        }

        if insn.op == Op::Lea && ops.len() >= 2 {
            if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                let tracked = src
                    .as_ref()
                    .and_then(Operand::mem)
                    .and_then(|mem| {
                        let base = mem.base?;
                        let base_offset = *self.self_bases.get(&base)?;
                        Some((mem, base_offset))
                    });
                match tracked {
                    Some((mem, base_offset)) => {
                        let offset = base_offset + mem.disp as i64;
                        match mem.index {
                            Some(index) => match self.reg_constants.get(&index).copied() {
                                Some(value) => {
                                    self.self_bases
                                        .insert(d, offset + value as i64 * mem.scale as i64);
                                }
                                None => {
                                    self.self_bases.remove(&d);
                                }
                            },
                            None => {
                                self.self_bases.insert(d, offset);
                            }
                        }
                    }
                    None => {
                        self.self_bases.remove(&d);
                    }
                }
                self.reg_constants.remove(&d);
            }
            return;
        }

        if insn.op.writes_gpr_dst() && !matches!(insn.op, Op::Lea | Op::Add | Op::Sub) {
            if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                self.self_bases.remove(&d);
                self.reg_constants.remove(&d);
            }
        }
    }

    fn read_scalar(&self, address: u32, width: Width) -> Option<f64> {
        let pe = self.pe?;
        match width {
            Width::Qword => pe.read_f64(address),
            _ => pe.read_f32(address).map(f64::from),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn xmm_step(&mut self, insn: &Insn) {
        let ops = &insn.operands;
        let dst = ops.first().copied();
        let src = ops.get(1).copied();
        let dst_x = dst.as_ref().and_then(Operand::xmm);
        let src_x = src.as_ref().and_then(Operand::xmm);

        match insn.op {
            Op::Xorps | Op::Xorpd | Op::Pxor => {
                if let Some(d) = dst_x {
                    if src_x == Some(d) {
                        let width = if insn.op == Op::Xorps {
                            Width::Dword
                        } else {
                            Width::Qword
                        };
                        self.set_xmm(d, Some(0.0), Some(0), width);
                    } else {
                        self.xmm.remove(&d);
                    }
                }
            }
            Op::Cvtsi2ss | Op::Cvtsi2sd => {
                if let Some(d) = dst_x {
                    let value = src
                        .as_ref()
                        .and_then(Operand::gpr)
                        .and_then(|s| self.reg_constants.get(&s).copied())
                        .map(f64::from);
                    match value {
                        Some(value) => {
                            let width = if insn.op == Op::Cvtsi2sd {
                                Width::Qword
                            } else {
                                Width::Dword
                            };
                            self.set_xmm_scalar(d, value, width);
                        }
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                }
            }
            Op::Cvtss2sd | Op::Cvtsd2ss => {
                if let Some(d) = dst_x {
                    match src_x.and_then(|s| self.xmm_float(s)) {
                        Some(value) => {
                            let width = if insn.op == Op::Cvtss2sd {
                                Width::Qword
                            } else {
                                Width::Dword
                            };
                            self.set_xmm_scalar(d, value, width);
                        }
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                }
            }
            Op::Cvtps2pd | Op::Cvtpd2ps => {
                if let Some(d) = dst_x {
                    let value = match src_x {
                        Some(s) => self.xmm_float(s),
                        None => src
                            .as_ref()
                            .and_then(Operand::mem)
                            .and_then(|mem| self.mem_address(&mem))
                            .and_then(|address| {
                                let width = if insn.op == Op::Cvtpd2ps {
                                    Width::Qword
                                } else {
                                    Width::Dword
                                };
                                self.read_scalar(address, width)
                            }),
                    };
                    match value {
                        Some(value) => {
                            let width = if insn.op == Op::Cvtps2pd {
                                Width::Qword
                            } else {
                                Width::Dword
                            };
                            self.set_xmm_scalar(d, value, width);
                        }
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                }
            }
            Op::Cvttss2si | Op::Cvtss2si | Op::Cvttsd2si | Op::Cvtsd2si => {
                if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                    match src_x.and_then(|s| self.xmm_float(s)) {
                        Some(value) => {
                            self.reg_constants.insert(d, value as i64 as u32);
                        }
                        None => {
                            self.reg_constants.remove(&d);
                        }
                    }
                }
            }
            Op::Movss | Op::Movsd => {
                if let Some(d) = dst_x {
                    if let Some(s) = src_x {
                        self.copy_xmm(d, s);
                        return;
                    }
                    let loaded = src
                        .as_ref()
                        .and_then(Operand::mem)
                        .and_then(|mem| self.mem_address(&mem))
                        .and_then(|address| {
                            let pe = self.pe?;
                            if insn.op == Op::Movsd {
                                let bits = pe.read_u64(address)?;
                                Some((bits, f64::from_bits(bits), Width::Qword))
                            } else {
                                let bits = pe.read_u32(address)?;
                                Some((
                                    bits as u64,
                                    f32::from_bits(bits) as f64,
                                    Width::Dword,
                                ))
                            }
                        });
                    match loaded {
                        Some((bits, value, width)) => {
                            self.set_xmm(d, Some(value), Some(bits), width);
                        }
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                } else if let Some(s) = src_x {
                    let offset = dst
                        .as_ref()
                        .and_then(Operand::mem)
                        .and_then(|mem| self.self_offset(&mem));
                    if let (Some(offset), Some(value)) = (offset, self.xmm_float(s)) {
                        self.record_float(offset, value);
                    }
                }
            }
            Op::Movd | Op::Movq => {
                let width = if insn.op == Op::Movq {
                    Width::Qword
                } else {
                    Width::Dword
                };
                if let Some(d) = dst_x {
                    if let Some(s) = src_x {
                        self.copy_xmm(d, s);
                        return;
                    }
                    if let Some(constant) = src
                        .as_ref()
                        .and_then(Operand::gpr)
                        .and_then(|s| self.reg_constants.get(&s).copied())
                    {
                        let bits = constant as u64;
                        let value = match width {
                            Width::Qword => f64::from_bits(bits),
                            _ => f32::from_bits(bits as u32) as f64,
                        };
                        self.set_xmm(d, Some(value), Some(bits), width);
                        return;
                    }
                    let loaded = src
                        .as_ref()
                        .and_then(Operand::mem)
                        .and_then(|mem| self.mem_address(&mem))
                        .and_then(|address| {
                            let pe = self.pe?;
                            match width {
                                Width::Qword => pe.read_u64(address),
                                _ => pe.read_u32(address).map(u64::from),
                            }
                        });
                    match loaded {
                        Some(bits) => {
                            let value = match width {
                                Width::Qword => f64::from_bits(bits),
                                _ => f32::from_bits(bits as u32) as f64,
                            };
                            self.set_xmm(d, Some(value), Some(bits), width);
                        }
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                    return;
                }
                if let Some(d) = dst.as_ref().and_then(Operand::gpr) {
                    if let Some(s) = src_x {
                        let bits = self.xmm.get(&s).and_then(|c| {
                            c.bits
                                .or_else(|| c.value.map(|v| (v as f32).to_bits() as u64))
                        });
                        match bits {
                            Some(bits) => {
                                self.reg_constants.insert(d, bits as u32);
                            }
                            None => {
                                self.reg_constants.remove(&d);
                            }
                        }
                    }
                    return;
                }
                if let Some(s) = src_x {
                    let offset = dst
                        .as_ref()
                        .and_then(Operand::mem)
                        .and_then(|mem| self.self_offset(&mem));
                    let Some(offset) = offset else { return };
                    let Some(constant) = self.xmm.get(&s).copied() else {
                        return;
                    };
                    match width {
                        Width::Qword => {
                            let value = constant
                                .value
                                .or_else(|| constant.bits.map(f64::from_bits));
                            if let Some(value) = value {
                                self.record_float(offset, value);
                            }
                        }
                        _ => {
                            let bits = constant.bits.map(|b| b as u32).or_else(|| {
                                constant.value.map(|v| (v as f32).to_bits())
                            });
                            if let Some(bits) = bits {
                                self.record_int(offset, bits as i64, 0xFFFF_FFFF);
                            }
                        }
                    }
                }
            }
            Op::Movdqa | Op::Movdqu => {
                if let Some(d) = dst_x {
                    if let Some(s) = src_x {
                        self.copy_xmm(d, s);
                        return;
                    }
                    let loaded = src
                        .as_ref()
                        .and_then(Operand::mem)
                        .and_then(|mem| self.mem_address(&mem))
                        .and_then(|address| self.pe?.read_u32(address));
                    match loaded {
                        Some(bits) => {
                            self.set_xmm(
                                d,
                                Some(f32::from_bits(bits) as f64),
                                Some(bits as u64),
                                Width::Dword,
                            );
                        }
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                    return;
                }
                if let Some(s) = src_x {
                    let offset = dst
                        .as_ref()
                        .and_then(Operand::mem)
                        .and_then(|mem| self.self_offset(&mem));
                    if let (Some(offset), Some(value)) = (offset, self.xmm_float(s)) {
                        self.record_float(offset, value);
                    }
                }
            }
            _ if insn.op.is_mov_family() => {
                if let Some(d) = dst_x {
                    match src_x {
                        Some(s) => self.copy_xmm(d, s),
                        None => {
                            self.xmm.remove(&d);
                        }
                    }
                }
            }
            _ => {
                if let Some(d) = dst_x {
                    self.xmm.remove(&d);
                }
            }
        }
    }
}

/// Run the interpreter over a decoded instruction stream. The image is used
/// to resolve scalar loads from fixed data addresses; `fields` names the
/// destination offsets.
pub fn analyze(
    insns: &[Insn],
    pe: Option<&PeImage>,
    fields: &BTreeMap<u32, FieldDescriptor>,
) -> Effects {
    let mut machine = Machine::new(pe, fields);
    for (idx, insn) in insns.iter().enumerate() {
        match insn.op {
            Op::Ret => {
                machine.reset();
                continue;
            }
            Op::Call => {
                machine.call_clobber();
                continue;
            }
            _ => {}
        }
        machine.seed_self_bases(insn);
        machine.sf_step(insn);
        machine.state_step(idx, insn);
    }
    machine.effects
}
