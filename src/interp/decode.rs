//! A linear-sweep decoder for the x86-32 subset the analysis consumes. The
//! goal is alignment, not completeness: common compiler output decodes into
//! typed instructions, anything else ends the stream for that function.

use num_traits::FromPrimitive;

use super::insn::{Insn, MemRef, Op, Operand, Reg, Width};

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Option<u8> {
        let value = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn i8(&mut self) -> Option<i32> {
        Some(self.u8()? as i8 as i32)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.bytes.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Option<i32> {
        Some(self.u32()? as i32)
    }
}

#[derive(Default, Clone, Copy)]
struct Prefixes {
    opsize: bool,
    rep: Option<u8>,
}

enum Rm {
    Reg(u8),
    Mem(MemRef),
}

struct ModRm {
    reg: u8,
    rm: Rm,
}

fn gpr(n: u8) -> Option<Reg> {
    Reg::from_u8(n & 7)
}

fn parse_modrm(cur: &mut Cursor<'_>) -> Option<ModRm> {
    let modrm = cur.u8()?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    if mode == 3 {
        return Some(ModRm { reg, rm: Rm::Reg(rm) });
    }

    let mut base = Some(rm);
    let mut index = None;
    let mut scale = 1u8;
    if rm == 4 {
        let sib = cur.u8()?;
        scale = 1 << (sib >> 6);
        let index_field = (sib >> 3) & 7;
        if index_field != 4 {
            index = Some(index_field);
        }
        let base_field = sib & 7;
        if base_field == 5 && mode == 0 {
            base = None;
        } else {
            base = Some(base_field);
        }
    } else if rm == 5 && mode == 0 {
        base = None;
    }

    let disp = match (mode, base) {
        (0, None) => cur.i32()?,
        (0, Some(_)) => 0,
        (1, _) => cur.i8()?,
        (2, _) => cur.i32()?,
        _ => 0,
    };

    let mem = MemRef {
        base: match base {
            Some(n) => Some(gpr(n)?),
            None => None,
        },
        index: match index {
            Some(n) => Some(gpr(n)?),
            None => None,
        },
        scale,
        disp,
    };
    Some(ModRm {
        reg,
        rm: Rm::Mem(mem),
    })
}

fn rm_gpr(rm: &Rm) -> Option<Operand> {
    Some(match rm {
        Rm::Reg(n) => Operand::Reg(gpr(*n)?),
        Rm::Mem(mem) => Operand::Mem(*mem),
    })
}

fn rm_xmm(rm: &Rm) -> Operand {
    match rm {
        Rm::Reg(n) => Operand::Xmm(*n),
        Rm::Mem(mem) => Operand::Mem(*mem),
    }
}

fn imm_for(cur: &mut Cursor<'_>, prefixes: Prefixes) -> Option<i64> {
    if prefixes.opsize {
        Some(cur.u16()? as i64)
    } else {
        Some(cur.i32()? as i64)
    }
}

fn alu_width(prefixes: Prefixes) -> Width {
    if prefixes.opsize {
        Width::Word
    } else {
        Width::Dword
    }
}

const GROUP1_OPS: [Op; 8] = [
    Op::Add,
    Op::Or,
    Op::Adc,
    Op::Sbb,
    Op::And,
    Op::Sub,
    Op::Xor,
    Op::Cmp,
];
const SHIFT_OPS: [Op; 8] = [
    Op::Rol,
    Op::Ror,
    Op::Misc,
    Op::Misc,
    Op::Shl,
    Op::Shr,
    Op::Shl,
    Op::Sar,
];

fn decode_two_byte(cur: &mut Cursor<'_>, prefixes: Prefixes) -> Option<(Op, Width, Vec<Operand>)> {
    let opcode = cur.u8()?;
    match opcode {
        // Scalar and packed moves.
        0x10 | 0x11 => {
            let modrm = parse_modrm(cur)?;
            let op = match prefixes.rep {
                Some(0xF3) => Op::Movss,
                Some(0xF2) => Op::Movsd,
                _ => Op::Movups,
            };
            let width = if op == Op::Movsd {
                Width::Qword
            } else {
                Width::Dword
            };
            let xmm = Operand::Xmm(modrm.reg);
            let rm = rm_xmm(&modrm.rm);
            let operands = if opcode == 0x10 {
                vec![xmm, rm]
            } else {
                vec![rm, xmm]
            };
            Some((op, width, operands))
        }
        0x12..=0x17 => {
            let modrm = parse_modrm(cur)?;
            Some((
                Op::SseOther,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_xmm(&modrm.rm)],
            ))
        }
        0x18..=0x1F => {
            parse_modrm(cur)?;
            Some((Op::Misc, Width::Dword, Vec::new()))
        }
        0x28 | 0x29 => {
            let modrm = parse_modrm(cur)?;
            let xmm = Operand::Xmm(modrm.reg);
            let rm = rm_xmm(&modrm.rm);
            let operands = if opcode == 0x28 {
                vec![xmm, rm]
            } else {
                vec![rm, xmm]
            };
            Some((Op::Movaps, Width::Dword, operands))
        }
        0x2A => {
            let modrm = parse_modrm(cur)?;
            let op = match prefixes.rep {
                Some(0xF3) => Op::Cvtsi2ss,
                Some(0xF2) => Op::Cvtsi2sd,
                _ => return None,
            };
            Some((
                op,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_gpr(&modrm.rm)?],
            ))
        }
        0x2C | 0x2D => {
            let modrm = parse_modrm(cur)?;
            let op = match (opcode, prefixes.rep) {
                (0x2C, Some(0xF3)) => Op::Cvttss2si,
                (0x2C, Some(0xF2)) => Op::Cvttsd2si,
                (0x2D, Some(0xF3)) => Op::Cvtss2si,
                (0x2D, Some(0xF2)) => Op::Cvtsd2si,
                _ => return None,
            };
            Some((
                op,
                Width::Dword,
                vec![Operand::Reg(gpr(modrm.reg)?), rm_xmm(&modrm.rm)],
            ))
        }
        0x2E | 0x2F | 0x51..=0x56 | 0x58 | 0x59 | 0x5B..=0x5F => {
            let modrm = parse_modrm(cur)?;
            Some((
                Op::SseOther,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_xmm(&modrm.rm)],
            ))
        }
        0x57 => {
            let modrm = parse_modrm(cur)?;
            let op = if prefixes.opsize { Op::Xorpd } else { Op::Xorps };
            Some((
                op,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_xmm(&modrm.rm)],
            ))
        }
        0x5A => {
            let modrm = parse_modrm(cur)?;
            let op = match (prefixes.rep, prefixes.opsize) {
                (Some(0xF3), _) => Op::Cvtss2sd,
                (Some(0xF2), _) => Op::Cvtsd2ss,
                (None, true) => Op::Cvtpd2ps,
                (None, false) => Op::Cvtps2pd,
                _ => return None,
            };
            Some((
                op,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_xmm(&modrm.rm)],
            ))
        }
        0x6E => {
            if !prefixes.opsize {
                return None;
            }
            let modrm = parse_modrm(cur)?;
            Some((
                Op::Movd,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_gpr(&modrm.rm)?],
            ))
        }
        0x6F | 0x7F => {
            let modrm = parse_modrm(cur)?;
            let op = match (prefixes.opsize, prefixes.rep) {
                (true, _) => Op::Movdqa,
                (false, Some(0xF3)) => Op::Movdqu,
                _ => return None,
            };
            let xmm = Operand::Xmm(modrm.reg);
            let rm = rm_xmm(&modrm.rm);
            let operands = if opcode == 0x6F {
                vec![xmm, rm]
            } else {
                vec![rm, xmm]
            };
            Some((op, Width::Dword, operands))
        }
        0x7E => {
            let modrm = parse_modrm(cur)?;
            match (prefixes.rep, prefixes.opsize) {
                (Some(0xF3), _) => Some((
                    Op::Movq,
                    Width::Qword,
                    vec![Operand::Xmm(modrm.reg), rm_xmm(&modrm.rm)],
                )),
                (_, true) => Some((
                    Op::Movd,
                    Width::Dword,
                    vec![rm_gpr(&modrm.rm)?, Operand::Xmm(modrm.reg)],
                )),
                _ => None,
            }
        }
        0x80..=0x8F => {
            cur.i32()?;
            Some((Op::Jcc, Width::Dword, Vec::new()))
        }
        0x90..=0x9F => {
            let modrm = parse_modrm(cur)?;
            Some((Op::Setcc, Width::Byte, vec![rm_gpr(&modrm.rm)?]))
        }
        0xAF => {
            let modrm = parse_modrm(cur)?;
            Some((
                Op::Imul,
                alu_width(prefixes),
                vec![Operand::Reg(gpr(modrm.reg)?), rm_gpr(&modrm.rm)?],
            ))
        }
        0xB6 | 0xB7 | 0xBE | 0xBF => {
            let modrm = parse_modrm(cur)?;
            Some((
                Op::Mov,
                Width::Dword,
                vec![Operand::Reg(gpr(modrm.reg)?), rm_gpr(&modrm.rm)?],
            ))
        }
        0xC8..=0xCF => Some((
            Op::Misc,
            Width::Dword,
            vec![Operand::Reg(gpr(opcode & 7)?)],
        )),
        0xD6 => {
            if !prefixes.opsize {
                return None;
            }
            let modrm = parse_modrm(cur)?;
            Some((
                Op::Movq,
                Width::Qword,
                vec![rm_xmm(&modrm.rm), Operand::Xmm(modrm.reg)],
            ))
        }
        0xEF => {
            if !prefixes.opsize {
                return None;
            }
            let modrm = parse_modrm(cur)?;
            Some((
                Op::Pxor,
                Width::Dword,
                vec![Operand::Xmm(modrm.reg), rm_xmm(&modrm.rm)],
            ))
        }
        _ => None,
    }
}

fn decode_x87(cur: &mut Cursor<'_>, opcode: u8) -> Option<(Op, Width, Vec<Operand>)> {
    let modrm_byte = *cur.bytes.get(cur.pos)?;
    if modrm_byte >> 6 == 3 {
        cur.pos += 1;
        if opcode == 0xD9 {
            match modrm_byte {
                0xE8 => return Some((Op::Fld1, Width::Dword, Vec::new())),
                0xEE => return Some((Op::Fldz, Width::Dword, Vec::new())),
                _ => {}
            }
        }
        return Some((Op::FpuOther, Width::Dword, Vec::new()));
    }
    let modrm = parse_modrm(cur)?;
    let mem = rm_gpr(&modrm.rm)?;
    let (op, width) = match (opcode, modrm.reg) {
        (0xD9, 0) => (Op::Fld, Width::Dword),
        (0xD9, 2) => (Op::Fst, Width::Dword),
        (0xD9, 3) => (Op::Fstp, Width::Dword),
        (0xDD, 0) => (Op::Fld, Width::Qword),
        (0xDD, 2) => (Op::Fst, Width::Qword),
        (0xDD, 3) => (Op::Fstp, Width::Qword),
        _ => (Op::FpuOther, Width::Dword),
    };
    Some((op, width, vec![mem]))
}

#[allow(clippy::too_many_lines)]
fn decode_one(cur: &mut Cursor<'_>) -> Option<(Op, Width, Vec<Operand>)> {
    let mut prefixes = Prefixes::default();
    let opcode = loop {
        let byte = cur.u8()?;
        match byte {
            0x66 => prefixes.opsize = true,
            0xF2 | 0xF3 => prefixes.rep = Some(byte),
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 => {}
            _ => break byte,
        }
    };

    match opcode {
        0x0F => decode_two_byte(cur, prefixes),
        // The classic ALU block: 8 operations in 6 forms.
        0x00..=0x3D if opcode & 7 <= 5 => {
            let op = GROUP1_OPS[(opcode >> 3) as usize & 7];
            match opcode & 7 {
                0 => {
                    let modrm = parse_modrm(cur)?;
                    Some((
                        op,
                        Width::Byte,
                        vec![rm_gpr(&modrm.rm)?, Operand::Reg(gpr(modrm.reg)?)],
                    ))
                }
                1 => {
                    let modrm = parse_modrm(cur)?;
                    Some((
                        op,
                        alu_width(prefixes),
                        vec![rm_gpr(&modrm.rm)?, Operand::Reg(gpr(modrm.reg)?)],
                    ))
                }
                2 => {
                    let modrm = parse_modrm(cur)?;
                    Some((
                        op,
                        Width::Byte,
                        vec![Operand::Reg(gpr(modrm.reg)?), rm_gpr(&modrm.rm)?],
                    ))
                }
                3 => {
                    let modrm = parse_modrm(cur)?;
                    Some((
                        op,
                        alu_width(prefixes),
                        vec![Operand::Reg(gpr(modrm.reg)?), rm_gpr(&modrm.rm)?],
                    ))
                }
                4 => Some((
                    op,
                    Width::Byte,
                    vec![Operand::Reg(Reg::Eax), Operand::Imm(cur.i8()? as i64)],
                )),
                _ => Some((
                    op,
                    alu_width(prefixes),
                    vec![Operand::Reg(Reg::Eax), Operand::Imm(imm_for(cur, prefixes)?)],
                )),
            }
        }
        0x40..=0x47 => Some((
            Op::Inc,
            alu_width(prefixes),
            vec![Operand::Reg(gpr(opcode & 7)?)],
        )),
        0x48..=0x4F => Some((
            Op::Dec,
            alu_width(prefixes),
            vec![Operand::Reg(gpr(opcode & 7)?)],
        )),
        0x50..=0x57 => Some((
            Op::Push,
            Width::Dword,
            vec![Operand::Reg(gpr(opcode & 7)?)],
        )),
        0x58..=0x5F => Some((Op::Pop, Width::Dword, vec![Operand::Reg(gpr(opcode & 7)?)])),
        0x68 => Some((Op::Push, Width::Dword, vec![Operand::Imm(cur.i32()? as i64)])),
        0x69 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = imm_for(cur, prefixes)?;
            Some((
                Op::Imul,
                alu_width(prefixes),
                vec![Operand::Reg(gpr(modrm.reg)?), rm, Operand::Imm(imm)],
            ))
        }
        0x6A => Some((Op::Push, Width::Dword, vec![Operand::Imm(cur.i8()? as i64)])),
        0x6B => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = cur.i8()? as i64;
            Some((
                Op::Imul,
                alu_width(prefixes),
                vec![Operand::Reg(gpr(modrm.reg)?), rm, Operand::Imm(imm)],
            ))
        }
        0x70..=0x7F => {
            cur.i8()?;
            Some((Op::Jcc, Width::Dword, Vec::new()))
        }
        0x80 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = cur.u8()? as i64;
            Some((
                GROUP1_OPS[modrm.reg as usize],
                Width::Byte,
                vec![rm, Operand::Imm(imm)],
            ))
        }
        0x81 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = imm_for(cur, prefixes)?;
            Some((
                GROUP1_OPS[modrm.reg as usize],
                alu_width(prefixes),
                vec![rm, Operand::Imm(imm)],
            ))
        }
        0x83 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = cur.i8()? as i64;
            Some((
                GROUP1_OPS[modrm.reg as usize],
                alu_width(prefixes),
                vec![rm, Operand::Imm(imm)],
            ))
        }
        0x84 | 0x85 => {
            let modrm = parse_modrm(cur)?;
            let width = if opcode == 0x84 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                Op::Test,
                width,
                vec![rm_gpr(&modrm.rm)?, Operand::Reg(gpr(modrm.reg)?)],
            ))
        }
        0x86 | 0x87 => {
            let modrm = parse_modrm(cur)?;
            let width = if opcode == 0x86 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                Op::Xchg,
                width,
                vec![rm_gpr(&modrm.rm)?, Operand::Reg(gpr(modrm.reg)?)],
            ))
        }
        0x88 | 0x89 => {
            let modrm = parse_modrm(cur)?;
            let width = if opcode == 0x88 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                Op::Mov,
                width,
                vec![rm_gpr(&modrm.rm)?, Operand::Reg(gpr(modrm.reg)?)],
            ))
        }
        0x8A | 0x8B => {
            let modrm = parse_modrm(cur)?;
            let width = if opcode == 0x8A {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                Op::Mov,
                width,
                vec![Operand::Reg(gpr(modrm.reg)?), rm_gpr(&modrm.rm)?],
            ))
        }
        0x8D => {
            let modrm = parse_modrm(cur)?;
            Some((
                Op::Lea,
                Width::Dword,
                vec![Operand::Reg(gpr(modrm.reg)?), rm_gpr(&modrm.rm)?],
            ))
        }
        0x8F => {
            let modrm = parse_modrm(cur)?;
            Some((Op::Pop, Width::Dword, vec![rm_gpr(&modrm.rm)?]))
        }
        0x90 => Some((Op::Misc, Width::Dword, Vec::new())),
        0x91..=0x97 => Some((
            Op::Xchg,
            Width::Dword,
            vec![Operand::Reg(gpr(opcode & 7)?), Operand::Reg(Reg::Eax)],
        )),
        0x98 | 0x99 | 0x9E | 0x9F => Some((Op::Misc, Width::Dword, Vec::new())),
        0xA0 | 0xA1 => {
            let address = cur.u32()?;
            let width = if opcode == 0xA0 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                Op::Mov,
                width,
                vec![
                    Operand::Reg(Reg::Eax),
                    Operand::Mem(MemRef::absolute(address)),
                ],
            ))
        }
        0xA2 | 0xA3 => {
            let address = cur.u32()?;
            let width = if opcode == 0xA2 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                Op::Mov,
                width,
                vec![
                    Operand::Mem(MemRef::absolute(address)),
                    Operand::Reg(Reg::Eax),
                ],
            ))
        }
        // String operations; the repeat prefix was already consumed.
        0xA4..=0xA7 | 0xAA..=0xAF => Some((Op::Misc, Width::Dword, Vec::new())),
        0xA8 => Some((
            Op::Test,
            Width::Byte,
            vec![Operand::Reg(Reg::Eax), Operand::Imm(cur.u8()? as i64)],
        )),
        0xA9 => Some((
            Op::Test,
            alu_width(prefixes),
            vec![Operand::Reg(Reg::Eax), Operand::Imm(imm_for(cur, prefixes)?)],
        )),
        0xB0..=0xB7 => {
            let reg = gpr(opcode & 7)?;
            let imm = cur.u8()? as i64;
            Some((
                Op::Mov,
                Width::Byte,
                vec![Operand::Reg(reg), Operand::Imm(imm)],
            ))
        }
        0xB8..=0xBF => {
            let reg = gpr(opcode & 7)?;
            let imm = imm_for(cur, prefixes)?;
            Some((
                Op::Mov,
                alu_width(prefixes),
                vec![Operand::Reg(reg), Operand::Imm(imm)],
            ))
        }
        0xC0 | 0xC1 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = cur.u8()? as i64;
            let width = if opcode == 0xC0 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            Some((
                SHIFT_OPS[modrm.reg as usize],
                width,
                vec![rm, Operand::Imm(imm)],
            ))
        }
        0xC2 => {
            cur.u16()?;
            Some((Op::Ret, Width::Dword, Vec::new()))
        }
        0xC3 => Some((Op::Ret, Width::Dword, Vec::new())),
        0xC6 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = cur.u8()? as i64;
            Some((Op::Mov, Width::Byte, vec![rm, Operand::Imm(imm)]))
        }
        0xC7 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let imm = imm_for(cur, prefixes)?;
            Some((
                Op::Mov,
                alu_width(prefixes),
                vec![rm, Operand::Imm(imm)],
            ))
        }
        0xC9 => Some((Op::Misc, Width::Dword, Vec::new())),
        0xCC => Some((Op::Misc, Width::Dword, Vec::new())),
        0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let width = if opcode & 1 == 0 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            let count = if opcode < 0xD2 {
                Operand::Imm(1)
            } else {
                Operand::Reg(Reg::Ecx)
            };
            Some((SHIFT_OPS[modrm.reg as usize], width, vec![rm, count]))
        }
        0xD8..=0xDF => decode_x87(cur, opcode),
        0xE8 => {
            cur.i32()?;
            Some((Op::Call, Width::Dword, Vec::new()))
        }
        0xE9 => {
            cur.i32()?;
            Some((Op::Jmp, Width::Dword, Vec::new()))
        }
        0xEB => {
            cur.i8()?;
            Some((Op::Jmp, Width::Dword, Vec::new()))
        }
        0xF6 | 0xF7 => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            let width = if opcode == 0xF6 {
                Width::Byte
            } else {
                alu_width(prefixes)
            };
            match modrm.reg {
                0 | 1 => {
                    let imm = if opcode == 0xF6 {
                        cur.u8()? as i64
                    } else {
                        imm_for(cur, prefixes)?
                    };
                    Some((Op::Test, width, vec![rm, Operand::Imm(imm)]))
                }
                2 => Some((Op::Not, width, vec![rm])),
                3 => Some((Op::Neg, width, vec![rm])),
                4 => Some((Op::Mul, width, vec![rm])),
                5 => Some((Op::Imul, width, vec![rm])),
                6 => Some((Op::Div, width, vec![rm])),
                _ => Some((Op::Idiv, width, vec![rm])),
            }
        }
        0xF5 | 0xF8 | 0xF9 | 0xFC | 0xFD => Some((Op::Misc, Width::Dword, Vec::new())),
        0xFE => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            match modrm.reg {
                0 => Some((Op::Inc, Width::Byte, vec![rm])),
                1 => Some((Op::Dec, Width::Byte, vec![rm])),
                _ => None,
            }
        }
        0xFF => {
            let modrm = parse_modrm(cur)?;
            let rm = rm_gpr(&modrm.rm)?;
            match modrm.reg {
                0 => Some((Op::Inc, alu_width(prefixes), vec![rm])),
                1 => Some((Op::Dec, alu_width(prefixes), vec![rm])),
                2 => Some((Op::Call, Width::Dword, vec![rm])),
                4 => Some((Op::Jmp, Width::Dword, vec![rm])),
                6 => Some((Op::Push, Width::Dword, vec![rm])),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Decode instructions linearly from `bytes`, which start at virtual
/// address `va`. Decoding stops at the first byte sequence outside the
/// supported subset.
pub fn decode_all(bytes: &[u8], va: u32) -> Vec<Insn> {
    let mut cur = Cursor { bytes, pos: 0 };
    let mut insns = Vec::new();
    while cur.pos < bytes.len() {
        let start = cur.pos;
        let Some((op, width, operands)) = decode_one(&mut cur) else {
            log::trace!(
                "stopping decode at {:#x}: unsupported byte {:#04x}",
                va as usize + start,
                bytes[start]
            );
            break;
        };
        insns.push(Insn {
            va: va.wrapping_add(start as u32),
            op,
            width,
            operands,
        });
    }
    insns
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use paste::paste;

    macro_rules! decode_test {
        ($name:ident, $bytes:expr, $op:expr, $operands:expr) => {
            paste! {
                #[test]
                fn [<test_decode_ $name>]() {
                    let insns = decode_all(&$bytes, 0x1000_0000);
                    assert_eq!(insns.len(), 1, "expected one instruction");
                    assert_eq!(insns[0].op, $op);
                    assert_eq!(insns[0].operands, $operands);
                }
            }
        };
    }

    decode_test!(
        mov_reg_from_esp,
        [0x8B, 0x44, 0x24, 0x08],
        Op::Mov,
        vec![
            Operand::Reg(Reg::Eax),
            Operand::Mem(MemRef {
                base: Some(Reg::Esp),
                index: None,
                scale: 1,
                disp: 8,
            }),
        ]
    );

    decode_test!(
        mov_spawnflags_imm,
        [0xC7, 0x80, 0x1C, 0x01, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00],
        Op::Mov,
        vec![
            Operand::Mem(MemRef {
                base: Some(Reg::Eax),
                index: None,
                scale: 1,
                disp: 0x11C,
            }),
            Operand::Imm(0x42),
        ]
    );

    decode_test!(
        and_spawnflags_imm,
        [0x81, 0xA0, 0x1C, 0x01, 0x00, 0x00, 0x7F, 0xFF, 0xFF, 0xFF],
        Op::And,
        vec![
            Operand::Mem(MemRef {
                base: Some(Reg::Eax),
                index: None,
                scale: 1,
                disp: 0x11C,
            }),
            Operand::Imm(0xFFFFFF7Fu32 as i32 as i64),
        ]
    );

    decode_test!(
        or_spawnflags_imm,
        [0x81, 0x88, 0x1C, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00],
        Op::Or,
        vec![
            Operand::Mem(MemRef {
                base: Some(Reg::Eax),
                index: None,
                scale: 1,
                disp: 0x11C,
            }),
            Operand::Imm(0x100),
        ]
    );

    decode_test!(
        lea_with_sib,
        [0x8D, 0x44, 0x8E, 0x10],
        Op::Lea,
        vec![
            Operand::Reg(Reg::Eax),
            Operand::Mem(MemRef {
                base: Some(Reg::Esi),
                index: Some(Reg::Ecx),
                scale: 4,
                disp: 0x10,
            }),
        ]
    );

    decode_test!(
        xorps_self,
        [0x0F, 0x57, 0xC0],
        Op::Xorps,
        vec![Operand::Xmm(0), Operand::Xmm(0)]
    );

    decode_test!(
        movss_store,
        [0xF3, 0x0F, 0x11, 0x46, 0x1C],
        Op::Movss,
        vec![
            Operand::Mem(MemRef {
                base: Some(Reg::Esi),
                index: None,
                scale: 1,
                disp: 0x1C,
            }),
            Operand::Xmm(0),
        ]
    );

    decode_test!(fld1, [0xD9, 0xE8], Op::Fld1, Vec::<Operand>::new());

    decode_test!(
        fstp_dword,
        [0xD9, 0x5E, 0x20],
        Op::Fstp,
        vec![Operand::Mem(MemRef {
            base: Some(Reg::Esi),
            index: None,
            scale: 1,
            disp: 0x20,
        })]
    );

    decode_test!(
        test_reg_imm,
        [0xF7, 0xC1, 0x04, 0x00, 0x00, 0x00],
        Op::Test,
        vec![Operand::Reg(Reg::Ecx), Operand::Imm(4)]
    );

    decode_test!(ret, [0xC3], Op::Ret, Vec::<Operand>::new());

    #[test]
    fn test_decode_sign_extended_group1() {
        // The imm8 group form sign-extends its operand.
        let insns = decode_all(&[0x83, 0xA0, 0x1C, 0x01, 0x00, 0x00, 0xF7], 0);
        assert_eq!(insns[0].op, Op::And);
        assert_eq!(insns[0].operands[1], Operand::Imm(-9));
    }

    #[test]
    fn test_decode_stops_on_unknown_bytes() {
        let insns = decode_all(&[0x90, 0x0F, 0x04, 0x90], 0);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].op, Op::Misc);
    }

    #[test]
    fn test_decode_call_and_disp32_absolute() {
        let insns = decode_all(
            &[
                0xE8, 0x10, 0x00, 0x00, 0x00, // call rel32
                0xA1, 0x28, 0x69, 0x04, 0x10, // mov eax, [0x10046928]
            ],
            0x1000_0000,
        );
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].op, Op::Call);
        assert_eq!(insns[1].op, Op::Mov);
        assert_eq!(
            insns[1].operands[1],
            Operand::Mem(MemRef::absolute(0x1004_6928))
        );
    }
}
