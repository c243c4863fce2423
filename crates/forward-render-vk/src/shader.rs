// SPDX-License-Identifier: CEPL-1.0
use ash::util::read_spv;
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use crate::device::Device;
use crate::error::ShaderError;

pub const VERTEX_FILE: &str = "vert.spv";
pub const FRAGMENT_FILE: &str = "frag.spv";

static EMBEDDED_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vert.spv"));
static EMBEDDED_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/frag.spv"));

/// Decodes SPIR-V words (checks length and magic, fixes endianness).
pub fn parse_spirv(origin: &str, bytes: &[u8]) -> Result<Vec<u32>, ShaderError> {
    read_spv(&mut Cursor::new(bytes)).map_err(|source| ShaderError::Spirv {
        origin: origin.to_owned(),
        source,
    })
}

pub fn read_spirv_file(path: &Path) -> Result<Vec<u32>, ShaderError> {
    let bytes = std::fs::read(path).map_err(|source| ShaderError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse_spirv(&path.display().to_string(), &bytes)
}

/// Transient shader stage; only needs to live until the pipeline is built.
pub struct ShaderModule {
    device: ash::Device,
    raw: vk::ShaderModule,
}

impl ShaderModule {
    pub fn from_words(device: &Device, code: &[u32]) -> Result<Self, ShaderError> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let raw = unsafe { device.raw().create_shader_module(&info, None) }?;
        Ok(Self {
            device: device.raw().clone(),
            raw,
        })
    }

    pub fn from_spirv(device: &Device, origin: &str, bytes: &[u8]) -> Result<Self, ShaderError> {
        Self::from_words(device, &parse_spirv(origin, bytes)?)
    }

    pub fn from_path(device: &Device, path: &Path) -> Result<Self, ShaderError> {
        Self::from_words(device, &read_spirv_file(path)?)
    }

    pub fn raw(&self) -> vk::ShaderModule {
        self.raw
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.raw, None) };
    }
}

pub struct TriangleShaders {
    pub vertex: ShaderModule,
    pub fragment: ShaderModule,
}

impl TriangleShaders {
    /// Loads `vert.spv`/`frag.spv` from `dir`, or the build-time shaders.
    pub fn load(device: &Device, dir: Option<&Path>) -> Result<Self, ShaderError> {
        match dir {
            Some(dir) => Ok(Self {
                vertex: ShaderModule::from_path(device, &dir.join(VERTEX_FILE))?,
                fragment: ShaderModule::from_path(device, &dir.join(FRAGMENT_FILE))?,
            }),
            None => Ok(Self {
                vertex: ShaderModule::from_spirv(device, "embedded vert.spv", EMBEDDED_VERT)?,
                fragment: ShaderModule::from_spirv(device, "embedded frag.spv", EMBEDDED_FRAG)?,
            }),
        }
    }
}
