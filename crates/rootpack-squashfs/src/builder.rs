use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::metadata::METADATA_BLOCK_SIZE;
use crate::superblock::{MAGIC, NO_TABLE, SUPERBLOCK_SIZE};

const NO_FRAGMENT: u32 = u32::MAX;
const UNCOMPRESSED_DATA: u32 = 1 << 24;
const UNCOMPRESSED_METADATA: u16 = 0x8000;

const TYPE_DIRECTORY: u16 = 1;
const TYPE_FILE: u16 = 2;
const TYPE_SYMLINK: u16 = 3;
const TYPE_FIFO: u16 = 6;

#[derive(Debug, Clone)]
enum Node {
    Directory {
        entries: BTreeMap<String, Node>,
        mode: u16,
    },
    File {
        contents: Vec<u8>,
        mode: u16,
    },
    Symlink {
        target: String,
    },
    Fifo,
    /// Second listing of an already written directory.
    Alias {
        target: String,
    },
}

impl Node {
    fn empty_dir() -> Self {
        Self::Directory {
            entries: BTreeMap::new(),
            mode: 0o755,
        }
    }

    fn count(&self) -> u32 {
        match self {
            Self::Directory { entries, .. } => 1 + entries.values().map(Node::count).sum::<u32>(),
            _ => 1,
        }
    }
}

/// Writes small SquashFS 4.0 images for tests.
///
/// Blocks are stored uncompressed unless zlib is enabled, in which case each
/// block is compressed when that makes it smaller. Full zero blocks are
/// written as sparse blocks.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    root: Node,
    block_log: u16,
    zlib: bool,
    fragments: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            root: Node::empty_dir(),
            block_log: 12,
            zlib: false,
            fragments: false,
        }
    }

    pub fn block_log(&mut self, block_log: u16) -> &mut Self {
        self.block_log = block_log;
        self
    }

    pub fn zlib(&mut self, enabled: bool) -> &mut Self {
        self.zlib = enabled;
        self
    }

    /// Packs file tails into shared fragment blocks.
    pub fn fragments(&mut self, enabled: bool) -> &mut Self {
        self.fragments = enabled;
        self
    }

    pub fn dir(&mut self, path: &str) -> &mut Self {
        self.insert(path, Node::empty_dir())
    }

    pub fn file(&mut self, path: &str, contents: impl AsRef<[u8]>) -> &mut Self {
        self.file_with_mode(path, contents, 0o644)
    }

    pub fn file_with_mode(
        &mut self,
        path: &str,
        contents: impl AsRef<[u8]>,
        mode: u16,
    ) -> &mut Self {
        self.insert(
            path,
            Node::File {
                contents: contents.as_ref().to_vec(),
                mode,
            },
        )
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.insert(
            path,
            Node::Symlink {
                target: target.to_string(),
            },
        )
    }

    pub fn fifo(&mut self, path: &str) -> &mut Self {
        self.insert(path, Node::Fifo)
    }

    /// Lists the directory `target` a second time under `path`. Images built
    /// this way are malformed on purpose. `target` must be written first, so
    /// it has to sort before `path` or live in an earlier sibling subtree.
    pub fn dir_alias(&mut self, path: &str, target: &str) -> &mut Self {
        self.insert(
            path,
            Node::Alias {
                target: target.trim_matches('/').to_string(),
            },
        )
    }

    pub fn build(&self) -> Vec<u8> {
        let Node::Directory { entries, mode } = &self.root else {
            unreachable!("builder root is always a directory");
        };

        let inode_count = self.root.count();
        let mut writer = Writer {
            image: vec![0_u8; SUPERBLOCK_SIZE],
            inodes: MetadataWriter::new(self.zlib),
            directories: MetadataWriter::new(self.zlib),
            fragment_entries: Vec::new(),
            fragment_block: Vec::new(),
            next_number: 2,
            written_dirs: HashMap::new(),
            block_size: 1_usize << self.block_log,
            zlib: self.zlib,
            fragments: self.fragments,
        };
        let root = writer.write_dir("", entries, *mode, 1, inode_count + 1);
        writer.finish(root, inode_count, self.block_log)
    }

    fn insert(&mut self, path: &str, node: Node) -> &mut Self {
        let components: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let Some((last, parents)) = components.split_last() else {
            panic!("image builder paths must not be empty");
        };

        let mut current = &mut self.root;
        for component in parents {
            let Node::Directory { entries, .. } = current else {
                panic!("parent of '{path}' is not a directory");
            };
            current = entries
                .entry((*component).to_string())
                .or_insert_with(Node::empty_dir);
        }

        let Node::Directory { entries, .. } = current else {
            panic!("parent of '{path}' is not a directory");
        };
        let keep_existing_dir = matches!(
            (entries.get(*last), &node),
            (Some(Node::Directory { .. }), Node::Directory { .. })
        );
        if !keep_existing_dir {
            entries.insert((*last).to_string(), node);
        }
        self
    }
}

struct Listed<'a> {
    name: &'a str,
    kind: u16,
    number: u32,
    reference: (u32, u16),
}

struct Writer {
    image: Vec<u8>,
    inodes: MetadataWriter,
    directories: MetadataWriter,
    fragment_entries: Vec<(u64, u32)>,
    fragment_block: Vec<u8>,
    next_number: u32,
    written_dirs: HashMap<String, ((u32, u16), u32)>,
    block_size: usize,
    zlib: bool,
    fragments: bool,
}

impl Writer {
    fn write_dir(
        &mut self,
        path: &str,
        entries: &BTreeMap<String, Node>,
        mode: u16,
        number: u32,
        parent: u32,
    ) -> (u32, u16) {
        let mut numbered = Vec::new();
        for (name, node) in entries {
            numbered.push((name.as_str(), node, self.next_number));
            self.next_number += 1;
        }

        let mut listed = Vec::new();
        for (name, node, mut child_number) in numbered {
            let (reference, kind) = match node {
                Node::Directory { entries, mode } => {
                    let child_path = if path.is_empty() {
                        name.to_string()
                    } else {
                        format!("{path}/{name}")
                    };
                    let reference =
                        self.write_dir(&child_path, entries, *mode, child_number, number);
                    self.written_dirs
                        .insert(child_path, (reference, child_number));
                    (reference, TYPE_DIRECTORY)
                }
                Node::Alias { target } => {
                    let Some((reference, target_number)) = self.written_dirs.get(target) else {
                        panic!("alias target '{target}' is not written yet");
                    };
                    child_number = *target_number;
                    (*reference, TYPE_DIRECTORY)
                }
                Node::File { contents, mode } => {
                    (self.write_file(contents, *mode, child_number), TYPE_FILE)
                }
                Node::Symlink { target } => {
                    (self.write_symlink(target, child_number), TYPE_SYMLINK)
                }
                Node::Fifo => (self.write_fifo(child_number), TYPE_FIFO),
            };
            listed.push(Listed {
                name,
                kind,
                number: child_number,
                reference,
            });
        }

        let (listing_block, listing_offset) = self.directories.position();
        let listing_size = self.write_listing(&listed);
        let subdirectories = listed
            .iter()
            .filter(|entry| entry.kind == TYPE_DIRECTORY)
            .count() as u32;

        let reference = self.inodes.position();
        let mut inode = inode_header(TYPE_DIRECTORY, mode, number);
        inode.extend_from_slice(&listing_block.to_le_bytes());
        inode.extend_from_slice(&(2 + subdirectories).to_le_bytes());
        inode.extend_from_slice(&((listing_size + 3) as u16).to_le_bytes());
        inode.extend_from_slice(&listing_offset.to_le_bytes());
        inode.extend_from_slice(&parent.to_le_bytes());
        self.inodes.write(&inode);
        reference
    }

    fn write_listing(&mut self, listed: &[Listed<'_>]) -> u32 {
        let mut out = Vec::new();
        let mut index = 0;
        while index < listed.len() {
            let first = &listed[index];
            let start = first.reference.0;
            let base = first.number;
            let run_len = listed[index..]
                .iter()
                .take(256)
                .take_while(|entry| {
                    entry.reference.0 == start
                        && (i64::from(entry.number) - i64::from(base)).abs()
                            <= i64::from(i16::MAX)
                })
                .count();

            out.extend_from_slice(&(run_len as u32 - 1).to_le_bytes());
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&base.to_le_bytes());
            for entry in &listed[index..index + run_len] {
                let delta = (i64::from(entry.number) - i64::from(base)) as i16;
                out.extend_from_slice(&entry.reference.1.to_le_bytes());
                out.extend_from_slice(&delta.to_le_bytes());
                out.extend_from_slice(&entry.kind.to_le_bytes());
                out.extend_from_slice(&((entry.name.len() - 1) as u16).to_le_bytes());
                out.extend_from_slice(entry.name.as_bytes());
            }
            index += run_len;
        }

        self.directories.write(&out);
        out.len() as u32
    }

    fn write_file(&mut self, contents: &[u8], mode: u16, number: u32) -> (u32, u16) {
        let block_size = self.block_size;
        let has_tail = self.fragments && contents.len() % block_size != 0;
        let full_blocks = if has_tail {
            contents.len() / block_size
        } else {
            contents.len().div_ceil(block_size)
        };

        let blocks_start = self.image.len() as u32;
        let mut block_sizes = Vec::new();
        for chunk in contents.chunks(block_size).take(full_blocks) {
            if chunk.len() == block_size && chunk.iter().all(|byte| *byte == 0) {
                block_sizes.push(0);
                continue;
            }
            let (stored, size_field) = self.encode_data(chunk);
            self.image.extend_from_slice(&stored);
            block_sizes.push(size_field);
        }

        let (fragment, fragment_offset) = if has_tail {
            let tail = &contents[full_blocks * block_size..];
            if self.fragment_block.len() + tail.len() > block_size {
                self.flush_fragment_block();
            }
            let offset = self.fragment_block.len() as u32;
            self.fragment_block.extend_from_slice(tail);
            (self.fragment_entries.len() as u32, offset)
        } else {
            (NO_FRAGMENT, 0)
        };

        let reference = self.inodes.position();
        let mut inode = inode_header(TYPE_FILE, mode, number);
        inode.extend_from_slice(&blocks_start.to_le_bytes());
        inode.extend_from_slice(&fragment.to_le_bytes());
        inode.extend_from_slice(&fragment_offset.to_le_bytes());
        inode.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        for size in block_sizes {
            inode.extend_from_slice(&size.to_le_bytes());
        }
        self.inodes.write(&inode);
        reference
    }

    fn write_symlink(&mut self, target: &str, number: u32) -> (u32, u16) {
        let reference = self.inodes.position();
        let mut inode = inode_header(TYPE_SYMLINK, 0o777, number);
        inode.extend_from_slice(&1_u32.to_le_bytes());
        inode.extend_from_slice(&(target.len() as u32).to_le_bytes());
        inode.extend_from_slice(target.as_bytes());
        self.inodes.write(&inode);
        reference
    }

    fn write_fifo(&mut self, number: u32) -> (u32, u16) {
        let reference = self.inodes.position();
        let mut inode = inode_header(TYPE_FIFO, 0o644, number);
        inode.extend_from_slice(&1_u32.to_le_bytes());
        self.inodes.write(&inode);
        reference
    }

    fn encode_data(&self, raw: &[u8]) -> (Vec<u8>, u32) {
        if self.zlib {
            let compressed = zlib_compress(raw);
            if compressed.len() < raw.len() {
                let size = compressed.len() as u32;
                return (compressed, size);
            }
        }
        (raw.to_vec(), raw.len() as u32 | UNCOMPRESSED_DATA)
    }

    fn flush_fragment_block(&mut self) {
        if self.fragment_block.is_empty() {
            return;
        }
        let block = std::mem::take(&mut self.fragment_block);
        let start = self.image.len() as u64;
        let (stored, size_field) = self.encode_data(&block);
        self.image.extend_from_slice(&stored);
        self.fragment_entries.push((start, size_field));
    }

    fn finish(mut self, root: (u32, u16), inode_count: u32, block_log: u16) -> Vec<u8> {
        self.flush_fragment_block();

        let inode_table = self.image.len() as u64;
        let (inodes, _) = std::mem::replace(&mut self.inodes, MetadataWriter::new(false)).finish();
        self.image.extend_from_slice(&inodes);

        let directory_table = self.image.len() as u64;
        let (directories, _) =
            std::mem::replace(&mut self.directories, MetadataWriter::new(false)).finish();
        self.image.extend_from_slice(&directories);

        let (fragment_table, fragment_count) = if self.fragment_entries.is_empty() {
            (NO_TABLE, 0)
        } else {
            let mut entries = MetadataWriter::new(self.zlib);
            for (start, size_field) in &self.fragment_entries {
                entries.write(&start.to_le_bytes());
                entries.write(&size_field.to_le_bytes());
                entries.write(&0_u32.to_le_bytes());
            }
            let entries_start = self.image.len() as u64;
            let (bytes, block_offsets) = entries.finish();
            self.image.extend_from_slice(&bytes);

            let table = self.image.len() as u64;
            for offset in block_offsets {
                self.image
                    .extend_from_slice(&(entries_start + offset).to_le_bytes());
            }
            (table, self.fragment_entries.len() as u32)
        };

        let mut ids = MetadataWriter::new(false);
        ids.write(&0_u32.to_le_bytes());
        let ids_start = self.image.len() as u64;
        let (id_bytes, _) = ids.finish();
        self.image.extend_from_slice(&id_bytes);
        let id_table = self.image.len() as u64;
        self.image.extend_from_slice(&ids_start.to_le_bytes());

        let bytes_used = self.image.len() as u64;
        let mut flags = 0_u16;
        if !self.zlib {
            flags |= 0x0001 | 0x0002 | 0x0008;
        }
        if !self.fragments {
            flags |= 0x0010;
        }
        let root_inode = (u64::from(root.0) << 16) | u64::from(root.1);

        let mut superblock = Vec::with_capacity(SUPERBLOCK_SIZE);
        superblock.extend_from_slice(&MAGIC.to_le_bytes());
        superblock.extend_from_slice(&inode_count.to_le_bytes());
        superblock.extend_from_slice(&0_u32.to_le_bytes());
        superblock.extend_from_slice(&(self.block_size as u32).to_le_bytes());
        superblock.extend_from_slice(&fragment_count.to_le_bytes());
        superblock.extend_from_slice(&1_u16.to_le_bytes());
        superblock.extend_from_slice(&block_log.to_le_bytes());
        superblock.extend_from_slice(&flags.to_le_bytes());
        superblock.extend_from_slice(&1_u16.to_le_bytes());
        superblock.extend_from_slice(&4_u16.to_le_bytes());
        superblock.extend_from_slice(&0_u16.to_le_bytes());
        superblock.extend_from_slice(&root_inode.to_le_bytes());
        superblock.extend_from_slice(&bytes_used.to_le_bytes());
        superblock.extend_from_slice(&id_table.to_le_bytes());
        superblock.extend_from_slice(&NO_TABLE.to_le_bytes());
        superblock.extend_from_slice(&inode_table.to_le_bytes());
        superblock.extend_from_slice(&directory_table.to_le_bytes());
        superblock.extend_from_slice(&fragment_table.to_le_bytes());
        superblock.extend_from_slice(&NO_TABLE.to_le_bytes());
        self.image[..SUPERBLOCK_SIZE].copy_from_slice(&superblock);
        self.image
    }
}

struct MetadataWriter {
    zlib: bool,
    finished: Vec<u8>,
    block_offsets: Vec<u64>,
    current: Vec<u8>,
}

impl MetadataWriter {
    fn new(zlib: bool) -> Self {
        Self {
            zlib,
            finished: Vec::new(),
            block_offsets: Vec::new(),
            current: Vec::new(),
        }
    }

    fn position(&self) -> (u32, u16) {
        (self.finished.len() as u32, self.current.len() as u16)
    }

    fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let take = (METADATA_BLOCK_SIZE - self.current.len()).min(bytes.len());
            self.current.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.current.len() == METADATA_BLOCK_SIZE {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.block_offsets.push(self.finished.len() as u64);
        let raw = std::mem::take(&mut self.current);
        if self.zlib {
            let compressed = zlib_compress(&raw);
            if compressed.len() < raw.len() {
                self.finished
                    .extend_from_slice(&(compressed.len() as u16).to_le_bytes());
                self.finished.extend_from_slice(&compressed);
                return;
            }
        }
        self.finished
            .extend_from_slice(&(raw.len() as u16 | UNCOMPRESSED_METADATA).to_le_bytes());
        self.finished.extend_from_slice(&raw);
    }

    fn finish(mut self) -> (Vec<u8>, Vec<u64>) {
        self.flush();
        (self.finished, self.block_offsets)
    }
}

fn inode_header(kind: u16, mode: u16, number: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(32);
    header.extend_from_slice(&kind.to_le_bytes());
    header.extend_from_slice(&mode.to_le_bytes());
    header.extend_from_slice(&0_u16.to_le_bytes());
    header.extend_from_slice(&0_u16.to_le_bytes());
    header.extend_from_slice(&0_u32.to_le_bytes());
    header.extend_from_slice(&number.to_le_bytes());
    header
}

fn zlib_compress(raw: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .expect("in-memory zlib encoding cannot fail");
    encoder
        .finish()
        .expect("in-memory zlib encoding cannot fail")
}
