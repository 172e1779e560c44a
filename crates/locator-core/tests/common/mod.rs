//! Synthetic managed runtime for end-to-end discovery tests
//!
//! Every instance is laid out the way a loaded module is in the runtime:
//!
//! ```text
//! module ─(+2w)─▶ pe_file ─(+2w)──▶ il_image ─(+buffer)─▶ "path" (UTF-16)
//!                    │                  ├─(loaded-2w)─▶ flat layout
//!                    │                  ├─(loaded-w)──▶ mapped layout (file only)
//!                    │                  ├─(loaded)────▶ loaded layout ─▶ image, cor header
//!                    │                  └─(md_import)─▶ md_import
//!                    └─(+0x28)─────────────────────────▶ md_import ─(+md_metadata)─▶ "BSJB"
//! ```

#![allow(dead_code)]

use locator_core::memory::layout::runtime;
use locator_core::{
    Address, AnchorValue, CaptureFile, Format, MemorySnapshot, PointerWidth, Sample, SampleKey,
    ReadMemory, Storage, StringEncoding,
};

pub const VARIANTS: [(&str, Format); 2] = [
    ("compressed", Format::Compressed),
    ("uncompressed", Format::Uncompressed),
];

const IMAGE_SIZE: usize = 0x3000;
const IMAGE_ALIGN: u64 = 0x1_0000;
const PE_FILE_MD_IMPORT: u64 = 0x28;

/// Field offsets of the synthetic runtime for one pointer width
#[derive(Debug, Clone, Copy)]
pub struct Offsets {
    pub w: u64,
    pub sstring_buffer: u64,
    pub loaded: u64,
    pub md_import: u64,
    pub md_metadata: u64,
    pub md_import_size: usize,
}

impl Offsets {
    pub fn new(width: PointerWidth) -> Self {
        match width {
            PointerWidth::Bit32 => Self {
                w: 4,
                sstring_buffer: 0xC,
                loaded: 0x58,
                md_import: 0x60,
                md_metadata: 0x368,
                md_import_size: 0x400,
            },
            PointerWidth::Bit64 => Self {
                w: 8,
                sstring_buffer: 0x10,
                loaded: 0x90,
                md_import: 0xA0,
                md_metadata: 0x5C8,
                md_import_size: 0x600,
            },
        }
    }

    pub fn mapped(&self) -> u64 {
        self.loaded - self.w
    }

    pub fn flat(&self) -> u64 {
        self.loaded - 2 * self.w
    }
}

/// Addresses of one built instance, for assertions
#[derive(Debug, Clone)]
pub struct Instance {
    pub base: Address,
    pub il_image: Address,
    pub path: String,
    pub md_import: Address,
    pub image_base: Address,
    pub loaded_layout: Address,
    pub mapped_image: Option<Address>,
    pub cor_header: Address,
    pub metadata: Address,
    pub metadata_size: u32,
}

pub struct InstanceSetup {
    pub storage: Storage,
    pub path: String,
    pub metadata_size: u32,
    pub with_mapped: bool,
    /// Extra "BSJB" pointer two slots before the real one
    pub decoy: bool,
}

pub struct Runtime {
    pub capture: CaptureFile,
    pub offsets: Offsets,
    layout_vtable: Address,
    vtables: Vec<(&'static str, Address)>,
    live_count: u32,
}

impl Runtime {
    /// Samples for every variant, storage and replicate
    pub fn new(width: PointerWidth, replicates: u8) -> Self {
        Self::build(width, replicates, false)
    }

    /// Both variants report the same discriminator
    pub fn with_shared_discriminator(width: PointerWidth, replicates: u8) -> Self {
        Self::build(width, replicates, true)
    }

    fn build(width: PointerWidth, replicates: u8, shared: bool) -> Self {
        let mut memory = MemorySnapshot::new(width);
        let layout_vtable = memory.alloc(0x40);
        let first = memory.alloc(0x40);
        let vtables = VARIANTS
            .iter()
            .map(|(name, _)| (*name, if shared { first } else { memory.alloc(0x40) }))
            .collect();

        let mut runtime = Self {
            capture: CaptureFile::new(memory),
            offsets: Offsets::new(width),
            layout_vtable,
            vtables,
            live_count: 0,
        };

        for (variant_index, (variant, format)) in VARIANTS.iter().enumerate() {
            let vtable = runtime.vtable(variant);
            for replicate in 0..replicates {
                for (storage_index, storage) in [Storage::File, Storage::Memory].into_iter().enumerate() {
                    let key = SampleKey::new(storage, *format, replicate);
                    let path = match storage {
                        Storage::File => format!("C:\\samples\\{}\\module_{}.dll", variant, replicate),
                        Storage::Memory => String::new(),
                    };
                    let metadata_size = 0x1000
                        + 0x100 * variant_index as u32
                        + 0x20 * replicate as u32
                        + 0x8 * storage_index as u32;
                    let setup = InstanceSetup {
                        storage,
                        path,
                        metadata_size,
                        with_mapped: storage == Storage::File,
                        decoy: storage == Storage::File && replicate == 0,
                    };
                    let instance = runtime.write_instance(vtable, &setup);
                    let sample = Sample::new(*variant, key, instance.base)
                        .with_anchor("md_import", AnchorValue::Address(instance.md_import))
                        .with_anchor("image_base", AnchorValue::Address(instance.image_base))
                        .with_anchor("file_path", AnchorValue::Text(instance.path.clone()))
                        .with_anchor("metadata_size", AnchorValue::Int(metadata_size as u64));
                    runtime.capture.add_sample(sample, Some(vtable));
                }
            }
        }
        runtime
    }

    pub fn vtable(&self, variant: &str) -> Address {
        self.vtables
            .iter()
            .find(|(name, _)| *name == variant)
            .map(|(_, vtable)| *vtable)
            .unwrap()
    }

    /// A queryable instance outside the sample pool
    pub fn add_live(&mut self, vtable: Address, storage: Storage, with_mapped: bool) -> Instance {
        self.live_count += 1;
        let setup = InstanceSetup {
            storage,
            path: match storage {
                Storage::File => format!("D:\\live\\plugin_{}.dll", self.live_count),
                Storage::Memory => String::new(),
            },
            metadata_size: 0x7000 + self.live_count * 0x10,
            with_mapped,
            decoy: false,
        };
        let instance = self.write_instance(vtable, &setup);
        self.capture.add_instance(instance.base, Some(vtable));
        instance
    }

    pub fn samples_of<'a>(&'a self, variant: &'a str) -> impl Iterator<Item = &'a Sample> + 'a {
        self.capture.samples.iter().filter(move |s| s.variant == variant)
    }

    fn layout_object(&mut self, image: Address, cor_header: Address) -> Address {
        let width = self.capture.memory.pointer_width();
        let layout = runtime::pe_image_layout().compile(width);
        let memory = &mut self.capture.memory;
        let object = memory.alloc(0x40);
        memory.write_ptr(object, self.layout_vtable).unwrap();
        memory
            .write_ptr(object + layout.offset_of("decoder.base").unwrap() as u64, image)
            .unwrap();
        memory
            .write_u32(object + layout.offset_of("decoder.size").unwrap() as u64, IMAGE_SIZE as u32)
            .unwrap();
        memory
            .write_ptr(object + layout.offset_of("decoder.cor_header").unwrap() as u64, cor_header)
            .unwrap();
        object
    }

    fn write_instance(&mut self, vtable: Address, setup: &InstanceSetup) -> Instance {
        let o = self.offsets;

        let image_base = self.capture.memory.alloc_aligned(IMAGE_SIZE, IMAGE_ALIGN);
        let cor_header = image_base
            + match setup.storage {
                Storage::File => 0x2008,
                Storage::Memory => 0x208,
            };
        self.capture.memory.write_u32(cor_header, runtime::COR20_HEADER_SIZE).unwrap();
        self.capture.memory.write_u16(cor_header + 4, 2).unwrap();
        self.capture.memory.write_u16(cor_header + 6, 5).unwrap();
        let loaded_layout = self.layout_object(image_base, cor_header);

        let mapped_image = setup
            .with_mapped
            .then(|| self.capture.memory.alloc_aligned(IMAGE_SIZE, IMAGE_ALIGN));
        let mapped_layout = match mapped_image {
            Some(image) => self.layout_object(image, image + 0x2008),
            None => 0,
        };
        let flat_buffer = self.capture.memory.alloc(IMAGE_SIZE);
        let flat_layout = self.layout_object(flat_buffer, flat_buffer + 0x2008);

        let memory = &mut self.capture.memory;

        let metadata = memory.alloc(0x400);
        memory.write_u32(metadata, runtime::METADATA_SIGNATURE).unwrap();
        memory.write_u16(metadata + 4, 1).unwrap();
        memory.write_u16(metadata + 6, 1).unwrap();

        let md_import = memory.alloc(o.md_import_size);
        memory.write_ptr(md_import, vtable).unwrap();
        memory.write_ptr(md_import + o.md_metadata, metadata).unwrap();
        memory
            .write_u32(md_import + o.md_metadata + o.w, setup.metadata_size)
            .unwrap();
        if setup.decoy {
            let decoy = memory.alloc(0x40);
            memory.write_u32(decoy, runtime::METADATA_SIGNATURE).unwrap();
            memory
                .write_ptr(md_import + o.md_metadata - 2 * o.w, decoy)
                .unwrap();
        }

        let path_buffer = memory.alloc_string(&setup.path, StringEncoding::Utf16).unwrap();
        let il_image = memory.alloc(0x100);
        let chars = setup.path.encode_utf16().count() as u32;
        memory.write_u32(il_image, chars).unwrap();
        memory.write_u32(il_image + 4, chars + 1).unwrap();
        memory.write_ptr(il_image + o.sstring_buffer, path_buffer).unwrap();
        memory.write_ptr(il_image + o.flat(), flat_layout).unwrap();
        memory.write_ptr(il_image + o.mapped(), mapped_layout).unwrap();
        memory.write_ptr(il_image + o.loaded, loaded_layout).unwrap();
        memory.write_u32(il_image + o.loaded + o.w, 1).unwrap();
        memory.write_ptr(il_image + o.md_import, md_import).unwrap();

        let pe_file = memory.alloc(0x40);
        memory.write_u32(pe_file + o.w, 1).unwrap();
        memory.write_ptr(pe_file + 2 * o.w, il_image).unwrap();
        memory.write_ptr(pe_file + PE_FILE_MD_IMPORT, md_import).unwrap();

        let assembly = memory.alloc(0x40);
        let module = memory.alloc(0x40);
        memory.write_ptr(module + o.w, assembly).unwrap();
        memory.write_ptr(module + 2 * o.w, pe_file).unwrap();

        Instance {
            base: module,
            il_image,
            path: setup.path.clone(),
            md_import,
            image_base,
            loaded_layout,
            mapped_image,
            cor_header,
            metadata,
            metadata_size: setup.metadata_size,
        }
    }
}
