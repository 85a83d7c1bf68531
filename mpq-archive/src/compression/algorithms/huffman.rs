//! Storm Huffman codec
//!
//! The stream begins with one type byte selecting a fixed byte-frequency
//! table that seeds the code tree. Two virtual symbols extend the alphabet:
//! 0x100 terminates the stream and 0x101 escapes a byte that is absent from
//! the tree; the escaped byte follows as 8 raw bits and is then inserted
//! into the tree with weight 1. Encoder and decoder rebuild the tree with
//! the same deterministic procedure after every insertion, so their codes
//! stay in lock step. Bits are packed LSB-first.

use crate::{Error, Result};

/// End-of-stream marker symbol
const END_OF_STREAM: u16 = 0x100;
/// Escape symbol introducing a raw byte
const ESCAPE: u16 = 0x101;
/// Alphabet size including the two virtual symbols
const SYMBOL_COUNT: usize = 0x102;

// Initial byte weights per compression type. Type 0 is the sparse table
// (nearly everything arrives via escape), type 1 favors text-like data,
// type 2 favors mixed binary. 258 entries; the trailing two slots are
// placeholders for the virtual symbols, which are always forced to weight 1.
const BYTE_TO_WEIGHT_00: [u8; 258] = [
    0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02,
    0x00, 0x00,
];

const BYTE_TO_WEIGHT_01: [u8; 258] = [
    0x54, 0x16, 0x16, 0x0D, 0x0C, 0x08, 0x06, 0x05, 0x06, 0x05, 0x06, 0x03, 0x04, 0x04, 0x03, 0x05,
    0x0E, 0x0B, 0x14, 0x13, 0x13, 0x09, 0x0B, 0x06, 0x05, 0x04, 0x03, 0x02, 0x03, 0x02, 0x02, 0x02,
    0x0D, 0x07, 0x09, 0x06, 0x06, 0x04, 0x03, 0x02, 0x04, 0x03, 0x03, 0x03, 0x03, 0x03, 0x02, 0x02,
    0x09, 0x06, 0x04, 0x04, 0x04, 0x04, 0x03, 0x02, 0x03, 0x02, 0x02, 0x02, 0x02, 0x03, 0x02, 0x04,
    0x08, 0x03, 0x04, 0x07, 0x09, 0x05, 0x03, 0x03, 0x03, 0x03, 0x02, 0x02, 0x02, 0x03, 0x02, 0x02,
    0x03, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x02, 0x01, 0x01, 0x01, 0x02, 0x01, 0x02, 0x02,
    0x06, 0x0A, 0x08, 0x08, 0x06, 0x07, 0x04, 0x03, 0x04, 0x04, 0x02, 0x02, 0x04, 0x02, 0x03, 0x03,
    0x04, 0x03, 0x07, 0x07, 0x09, 0x06, 0x04, 0x03, 0x03, 0x02, 0x01, 0x02, 0x02, 0x02, 0x02, 0x02,
    0x0A, 0x02, 0x02, 0x03, 0x02, 0x02, 0x01, 0x01, 0x02, 0x02, 0x02, 0x06, 0x03, 0x05, 0x02, 0x03,
    0x02, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x01, 0x01,
    0x02, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x04, 0x04, 0x04, 0x07, 0x09, 0x08, 0x0C, 0x02,
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x01, 0x01, 0x03,
    0x04, 0x01, 0x02, 0x04, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01,
    0x04, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01,
    0x02, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01,
    0x02, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x02, 0x01, 0x01, 0x02, 0x02, 0x02, 0x06, 0x4B,
    0x00, 0x00,
];

const BYTE_TO_WEIGHT_02: [u8; 258] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x27, 0x00, 0x00, 0x23, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xFF, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x02, 0x01, 0x01, 0x06, 0x0E, 0x10, 0x04,
    0x06, 0x08, 0x05, 0x04, 0x04, 0x03, 0x03, 0x02, 0x02, 0x03, 0x03, 0x01, 0x01, 0x02, 0x01, 0x01,
    0x01, 0x04, 0x02, 0x04, 0x02, 0x02, 0x02, 0x01, 0x01, 0x04, 0x01, 0x01, 0x02, 0x03, 0x03, 0x02,
    0x03, 0x01, 0x03, 0x06, 0x04, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x02, 0x01, 0x02, 0x01, 0x01,
    0x01, 0x29, 0x07, 0x16, 0x12, 0x40, 0x0A, 0x0A, 0x11, 0x25, 0x01, 0x03, 0x17, 0x10, 0x26, 0x2A,
    0x10, 0x01, 0x23, 0x23, 0x2F, 0x10, 0x06, 0x07, 0x02, 0x09, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

const WEIGHT_TABLES: [&[u8; 258]; 3] = [&BYTE_TO_WEIGHT_00, &BYTE_TO_WEIGHT_01, &BYTE_TO_WEIGHT_02];

struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
    bit_buffer: u32,
    bit_count: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            bit_buffer: 0,
            bit_count: 0,
        }
    }

    fn get_bit(&mut self) -> Result<u32> {
        if self.bit_count == 0 {
            if self.position >= self.data.len() {
                return Err(Error::decompression("unexpected end of Huffman data"));
            }
            self.bit_buffer = self.data[self.position] as u32;
            self.position += 1;
            self.bit_count = 8;
        }

        let bit = self.bit_buffer & 1;
        self.bit_buffer >>= 1;
        self.bit_count -= 1;
        Ok(bit)
    }

    fn get_8_bits(&mut self) -> Result<u8> {
        let mut value = 0u8;
        for i in 0..8 {
            value |= (self.get_bit()? as u8) << i;
        }
        Ok(value)
    }
}

struct BitWriter {
    data: Vec<u8>,
    bit_buffer: u32,
    bit_count: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_buffer: 0,
            bit_count: 0,
        }
    }

    fn put_bit(&mut self, bit: u32) {
        self.bit_buffer |= (bit & 1) << self.bit_count;
        self.bit_count += 1;
        if self.bit_count == 8 {
            self.data.push(self.bit_buffer as u8);
            self.bit_buffer = 0;
            self.bit_count = 0;
        }
    }

    fn put_8_bits(&mut self, value: u8) {
        for i in 0..8 {
            self.put_bit((value >> i) as u32);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            self.data.push(self.bit_buffer as u8);
        }
        self.data
    }
}

enum NodeKind {
    Leaf(u16),
    Internal { zero: usize, one: usize },
}

struct Node {
    kind: NodeKind,
    parent: Option<(usize, u32)>,
}

/// Code tree shared by both directions
///
/// Rebuilt from the weight array whenever a symbol is inserted; the build is
/// fully deterministic (ties broken by lowest symbol in the subtree), which
/// is what keeps the encoder and decoder synchronized.
struct CodeTree {
    weights: [u32; SYMBOL_COUNT],
    nodes: Vec<Node>,
    root: usize,
    leaf_of: [Option<usize>; SYMBOL_COUNT],
}

impl CodeTree {
    fn from_table(compression_type: u8) -> Result<Self> {
        let table = WEIGHT_TABLES
            .get(compression_type as usize)
            .ok_or_else(|| Error::decompression("unknown Huffman compression type"))?;

        let mut weights = [0u32; SYMBOL_COUNT];
        for (symbol, &weight) in table.iter().take(0x100).enumerate() {
            weights[symbol] = weight as u32;
        }
        weights[END_OF_STREAM as usize] = 1;
        weights[ESCAPE as usize] = 1;

        let mut tree = Self {
            weights,
            nodes: Vec::new(),
            root: 0,
            leaf_of: [None; SYMBOL_COUNT],
        };
        tree.rebuild();
        Ok(tree)
    }

    fn contains(&self, symbol: u16) -> bool {
        self.weights[symbol as usize] > 0
    }

    fn insert(&mut self, symbol: u16) {
        self.weights[symbol as usize] = 1;
        self.rebuild();
    }

    /// Rebuild the code tree from the current weights
    ///
    /// Classic bottom-up Huffman merge over (weight, lowest-symbol) ordered
    /// candidates. The lower-ordered subtree becomes the zero child.
    fn rebuild(&mut self) {
        self.nodes.clear();
        self.leaf_of = [None; SYMBOL_COUNT];

        // (weight, lowest symbol in subtree, node index)
        let mut heap: std::collections::BinaryHeap<std::cmp::Reverse<(u64, u16, usize)>> =
            std::collections::BinaryHeap::new();

        for symbol in 0..SYMBOL_COUNT {
            let weight = self.weights[symbol];
            if weight == 0 {
                continue;
            }
            let index = self.nodes.push_and_index(Node {
                kind: NodeKind::Leaf(symbol as u16),
                parent: None,
            });
            self.leaf_of[symbol] = Some(index);
            heap.push(std::cmp::Reverse((weight as u64, symbol as u16, index)));
        }

        // The virtual symbols guarantee at least two leaves
        while heap.len() > 1 {
            let std::cmp::Reverse((w0, s0, zero)) = heap.pop().unwrap();
            let std::cmp::Reverse((w1, s1, one)) = heap.pop().unwrap();

            let parent = self.nodes.push_and_index(Node {
                kind: NodeKind::Internal { zero, one },
                parent: None,
            });
            self.nodes[zero].parent = Some((parent, 0));
            self.nodes[one].parent = Some((parent, 1));

            heap.push(std::cmp::Reverse((w0 + w1, s0.min(s1), parent)));
        }

        self.root = heap.pop().map(|std::cmp::Reverse((_, _, i))| i).unwrap();
    }

    fn encode_symbol(&self, symbol: u16, writer: &mut BitWriter) {
        let mut bits = Vec::with_capacity(32);
        let mut index = self.leaf_of[symbol as usize].expect("symbol not in tree");

        while let Some((parent, bit)) = self.nodes[index].parent {
            bits.push(bit);
            index = parent;
        }
        for &bit in bits.iter().rev() {
            writer.put_bit(bit);
        }
    }

    fn decode_symbol(&self, reader: &mut BitReader<'_>) -> Result<u16> {
        let mut index = self.root;
        loop {
            match self.nodes[index].kind {
                NodeKind::Leaf(symbol) => return Ok(symbol),
                NodeKind::Internal { zero, one } => {
                    index = if reader.get_bit()? == 0 { zero } else { one };
                }
            }
        }
    }
}

// Small convenience for arena pushes
trait PushAndIndex<T> {
    fn push_and_index(&mut self, value: T) -> usize;
}

impl<T> PushAndIndex<T> for Vec<T> {
    fn push_and_index(&mut self, value: T) -> usize {
        self.push(value);
        self.len() - 1
    }
}

/// Compress a block
///
/// `compression_type` selects the seed weight table; unknown types fall back
/// to the sparse table.
pub(crate) fn compress(data: &[u8], compression_type: u8) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let cmp_type = if (compression_type as usize) < WEIGHT_TABLES.len() {
        compression_type
    } else {
        0
    };

    let mut tree = CodeTree::from_table(cmp_type)?;
    let mut writer = BitWriter::new();
    writer.put_8_bits(cmp_type);

    for &byte in data {
        let symbol = byte as u16;
        if tree.contains(symbol) {
            tree.encode_symbol(symbol, &mut writer);
        } else {
            tree.encode_symbol(ESCAPE, &mut writer);
            writer.put_8_bits(byte);
            tree.insert(symbol);
        }
    }
    tree.encode_symbol(END_OF_STREAM, &mut writer);

    Ok(writer.finish())
}

/// Decompress a block
pub(crate) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = BitReader::new(data);
    let compression_type = reader.get_8_bits()?;
    let mut tree = CodeTree::from_table(compression_type)?;

    let mut output = Vec::with_capacity(expected_size);
    loop {
        let symbol = tree.decode_symbol(&mut reader)?;
        match symbol {
            END_OF_STREAM => break,
            ESCAPE => {
                let byte = reader.get_8_bits()?;
                output.push(byte);
                tree.insert(byte as u16);
            }
            _ => output.push(symbol as u8),
        }
        if output.len() >= expected_size {
            break;
        }
    }

    Ok(output)
}
