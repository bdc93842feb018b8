//! Identity of the machine and build that produced a cache entry.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;

use super::codec::{Reader, VERSION};
use crate::error::CacheError;
use crate::jit::backend::Arch;

/// CPU id and build id. Entries are only reused on an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineId {
    cpu_id: u32,
    build_id: Vec<u8>,
}

/// Build id of this linker: package name, version and cache format.
pub fn default_build_id() -> Vec<u8> {
    format!(
        "{}-{}/v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        VERSION
    )
    .into_bytes()
}

/// CPU features that change the code generator's output.
fn host_feature_bits() -> u32 {
    let mut bits = 0;
    #[cfg(target_arch = "x86_64")]
    {
        let features = [
            is_x86_feature_detected!("sse3"),
            is_x86_feature_detected!("ssse3"),
            is_x86_feature_detected!("sse4.1"),
            is_x86_feature_detected!("sse4.2"),
            is_x86_feature_detected!("popcnt"),
            is_x86_feature_detected!("avx"),
            is_x86_feature_detected!("avx2"),
            is_x86_feature_detected!("lzcnt"),
            is_x86_feature_detected!("bmi1"),
            is_x86_feature_detected!("bmi2"),
        ];
        for (i, present) in features.into_iter().enumerate() {
            if present {
                bits |= 1 << i;
            }
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        let features = [
            std::arch::is_aarch64_feature_detected!("neon"),
            std::arch::is_aarch64_feature_detected!("lse"),
            std::arch::is_aarch64_feature_detected!("crc"),
            std::arch::is_aarch64_feature_detected!("fp16"),
        ];
        for (i, present) in features.into_iter().enumerate() {
            if present {
                bits |= 1 << i;
            }
        }
    }
    bits
}

impl MachineId {
    pub fn new(cpu_id: u32, build_id: impl Into<Vec<u8>>) -> Self {
        Self {
            cpu_id,
            build_id: build_id.into(),
        }
    }

    /// `arch` with `features` folded above the arch tag.
    pub fn cpu_id_for(arch: Arch, features: u32) -> u32 {
        arch.tag() | (features << Arch::TAG_BITS)
    }

    /// The identity of this process, if its architecture is supported.
    pub fn host() -> Option<Self> {
        let arch = Arch::host()?;
        Some(Self::new(
            Self::cpu_id_for(arch, host_feature_bits()),
            default_build_id(),
        ))
    }

    /// The identity for code generated for `arch`: the host's features when
    /// `arch` is the host, none otherwise.
    pub fn for_arch(arch: Arch) -> Self {
        let features = if Arch::host() == Some(arch) {
            host_feature_bits()
        } else {
            0
        };
        Self::new(Self::cpu_id_for(arch, features), default_build_id())
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn build_id(&self) -> &[u8] {
        &self.build_id
    }

    pub fn arch(&self) -> Option<Arch> {
        Arch::from_tag(self.cpu_id & ((1 << Arch::TAG_BITS) - 1))
    }

    pub fn features(&self) -> u32 {
        self.cpu_id >> Arch::TAG_BITS
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.cpu_id)?;
        w.write_u32::<LittleEndian>(self.build_id.len() as u32)?;
        w.write_all(&self.build_id)
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, CacheError> {
        let cpu_id = r.u32()?;
        let len = r.count(1)?;
        let build_id = r.bytes(len)?;
        Ok(Self { cpu_id, build_id })
    }
}
