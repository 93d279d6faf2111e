/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Hand assembled x86-64 guest code.
//!
//! Only the instructions the tests need are here, and each one is encoded
//! the same way in 64-bit mode and by the emulated backend.

/// A sequence of x86-64 instructions, built one instruction at a time
///
/// # Example
///
/// ```
/// use hyperlight_testing::guest_code::GuestCode;
///
/// // out 0x3f8, 'A' ; hlt
/// let code = GuestCode::new().outb(0x3f8, b'A').hlt();
/// assert_eq!(code.as_bytes().last(), Some(&0xF4));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestCode {
    bytes: Vec<u8>,
}

impl GuestCode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn nop(self) -> Self {
        self.raw(&[0x90])
    }

    pub fn hlt(self) -> Self {
        self.raw(&[0xF4])
    }

    pub fn ud2(self) -> Self {
        self.raw(&[0x0F, 0x0B])
    }

    /// `mov al, imm8`
    pub fn mov_al(self, value: u8) -> Self {
        self.raw(&[0xB0, value])
    }

    /// `mov ax, imm16`
    pub fn mov_ax(self, value: u16) -> Self {
        self.raw(&[0x66, 0xB8]).raw(&value.to_le_bytes())
    }

    /// `mov eax, imm32`, zeroes the upper half of rax
    pub fn mov_eax(self, value: u32) -> Self {
        self.raw(&[0xB8]).raw(&value.to_le_bytes())
    }

    /// `mov dx, imm16`
    pub fn mov_dx(self, value: u16) -> Self {
        self.raw(&[0x66, 0xBA]).raw(&value.to_le_bytes())
    }

    /// `mov edx, imm32`, zeroes the upper half of rdx
    pub fn mov_edx(self, value: u32) -> Self {
        self.raw(&[0xBA]).raw(&value.to_le_bytes())
    }

    pub fn inc_al(self) -> Self {
        self.raw(&[0xFE, 0xC0])
    }

    pub fn dec_al(self) -> Self {
        self.raw(&[0xFE, 0xC8])
    }

    /// `out imm8, al`
    pub fn out_imm8_al(self, port: u8) -> Self {
        self.raw(&[0xE6, port])
    }

    /// `out dx, al`
    pub fn out_dx_al(self) -> Self {
        self.raw(&[0xEE])
    }

    /// Write `value` to `port`: `mov dx, port ; mov al, value ; out dx, al`
    pub fn outb(self, port: u16, value: u8) -> Self {
        self.mov_dx(port).mov_al(value).out_dx_al()
    }

    /// `jmp rel8`, relative to the end of the jump
    pub fn jmp_rel8(self, rel: i8) -> Self {
        self.raw(&[0xEB]).raw(&rel.to_le_bytes())
    }

    /// `jmp rel32`, relative to the end of the jump
    pub fn jmp_rel32(self, rel: i32) -> Self {
        self.raw(&[0xE9]).raw(&rel.to_le_bytes())
    }

    /// `jmp $`, spins until the guest is interrupted
    pub fn jmp_self(self) -> Self {
        self.jmp_rel8(-2)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
