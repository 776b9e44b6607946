//! Shared support for the end-to-end tests: a minimal RV32 instruction
//! encoder and an executable-image builder.

#![allow(dead_code)]

use nanoos_kern::exe;
use nanoos_kern::fs::{Filesystem, RamDisk};

pub mod rv32 {
    //! Hand assembler for the handful of instructions the test guests
    //! use. Registers are plain numbers; immediates are validated only
    //! as far as the tests need.

    fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
        let imm = imm as u32;
        ((imm >> 5 & 0x7F) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | ((imm & 0x1F) << 7)
            | 0x23
    }

    fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
        let imm = imm as u32;
        ((imm >> 12 & 0x1) << 31)
            | ((imm >> 5 & 0x3F) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | ((imm >> 1 & 0xF) << 8)
            | ((imm >> 11 & 0x1) << 7)
            | 0x63
    }

    pub fn lui(rd: u32, imm20: u32) -> u32 {
        (imm20 << 12) | (rd << 7) | 0x37
    }

    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 0x0, rd, 0x13)
    }

    pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
        r_type(0x00, rs2, rs1, 0x0, rd, 0x33)
    }

    pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
        r_type(0x20, rs2, rs1, 0x0, rd, 0x33)
    }

    pub fn mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
        r_type(0x01, rs2, rs1, 0x0, rd, 0x33)
    }

    pub fn div(rd: u32, rs1: u32, rs2: u32) -> u32 {
        r_type(0x01, rs2, rs1, 0x4, rd, 0x33)
    }

    pub fn rem(rd: u32, rs1: u32, rs2: u32) -> u32 {
        r_type(0x01, rs2, rs1, 0x6, rd, 0x33)
    }

    pub fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
        s_type(imm, rs2, rs1, 0x0)
    }

    pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
        s_type(imm, rs2, rs1, 0x2)
    }

    pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 0x4, rd, 0x03)
    }

    pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 0x2, rd, 0x03)
    }

    pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 0x0)
    }

    pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 0x1)
    }

    pub fn blt(rs1: u32, rs2: u32, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 0x4)
    }

    pub fn ecall() -> u32 {
        0x73
    }

    pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
        i_type(csr as i32, rs1, 0x2, rd, 0x73)
    }

    /// Loads a full 32-bit constant with LUI + ADDI, compensating for
    /// ADDI's sign extension.
    pub fn li(rd: u32, value: u32) -> [u32; 2] {
        let low = value & 0xFFF;
        let mut high = value >> 12;
        if low & 0x800 != 0 {
            high = high.wrapping_add(1) & 0xF_FFFF;
        }
        [lui(rd, high), addi(rd, rd, (low as i32) << 20 >> 20)]
    }
}

/// Builds an executable image (code, then initialized data, then the
/// version-1 trailer) and installs it on the disk under `name`.
pub fn install_program(disk: &mut RamDisk, name: &str, code: &[u32], data: &[u8]) {
    let mut image = Vec::with_capacity(code.len() * 4 + data.len());
    for word in code {
        image.extend_from_slice(&word.to_le_bytes());
    }
    let program_length = image.len() as u32;
    image.extend_from_slice(data);

    disk.install(name, &image);
    let mut file = disk.open(name).expect("ramdisk open cannot fail");
    exe::write_v1_trailer(file.as_mut(), program_length, data.len() as u32)
        .expect("trailer write on a ramdisk cannot fail");
}

/// Guest address of the first data byte for an image with `code` words
/// of program text.
pub fn data_address(code_words: usize) -> u32 {
    nanoos_kern::vm::RV32_PROGRAM_START + (code_words as u32) * 4
}
