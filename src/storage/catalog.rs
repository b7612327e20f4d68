//! The data source: a set of immutable tables, optionally persisted to a
//! memory-mappable cache file.
//!
//! Cache layout: a 2 MiB header (magic marker, table count, per-table and
//! per-column descriptors with byte extents), then all pages contiguously.
//! Every extent is 8 KiB-aligned so the mapped pages can be used in place.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{DbError, Result};
use crate::memory::mmap::Mmap;
use crate::storage::column::DataType;
use crate::storage::page::{Page, PagePtr, PAGE_SIZE};

/// ASCII "s1gmod25", packed little-endian.
const MARKER: u64 = {
    let text = *b"s1gmod25";
    let mut marker = 0u64;
    let mut i = 0;
    while i < 8 {
        marker |= (text[i] as u64) << (i * 8);
        i += 1;
    }
    marker
};

const HEADER_SIZE: usize = 1 << 21;
const NAME_LIMIT: usize = 1000;

#[derive(Debug)]
pub struct TableColumn {
    pub data_type: DataType,
    pub pages: Vec<PagePtr>,
}

#[derive(Debug)]
pub struct Table {
    pub num_rows: u64,
    pub columns: Vec<TableColumn>,
    pub name: String,
}

/// Owns a set of tables; readers never mutate them. When loaded from a
/// cache file the mapping keeps the pages alive.
#[derive(Default, Debug)]
pub struct DataSource {
    pub relations: Vec<Table>,
    mapping: Option<Mmap>,
}

struct HeaderWriter {
    buffer: Vec<u8>,
}

impl HeaderWriter {
    fn new() -> Self {
        HeaderWriter { buffer: Vec::with_capacity(HEADER_SIZE) }
    }

    fn push_u64(&mut self, value: u64) -> Result<()> {
        if self.buffer.len() + 8 > HEADER_SIZE {
            return Err(DbError::Storage("cache header too large".into()));
        }
        self.buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn push_name(&mut self, name: &str) -> Result<()> {
        let mut fixed = [0u8; NAME_LIMIT];
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LIMIT);
        fixed[..len].copy_from_slice(&bytes[..len]);
        if self.buffer.len() + NAME_LIMIT > HEADER_SIZE {
            return Err(DbError::Storage("cache header too large".into()));
        }
        self.push_u64(len as u64)?;
        self.buffer.extend_from_slice(&fixed);
        Ok(())
    }
}

struct HeaderReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    fn read_u64(&mut self) -> Result<u64> {
        if self.pos + 8 > self.data.len() {
            return Err(DbError::Storage("cache file corrupted: header truncated".into()));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(raw))
    }

    fn read_name(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        if len > NAME_LIMIT || self.pos + NAME_LIMIT > self.data.len() {
            return Err(DbError::Storage("cache file corrupted: bad name".into()));
        }
        let name = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
        self.pos += NAME_LIMIT;
        Ok(name)
    }
}

impl DataSource {
    /// Persist all tables to `path`, via a temp file and rename.
    pub fn serialize(self, path: &Path) -> Result<()> {
        let temp = path.with_extension("tmp");

        let mut header = HeaderWriter::new();
        header.push_u64(MARKER)?;
        header.push_u64(self.relations.len() as u64)?;
        let mut cur_page = HEADER_SIZE as u64;
        for table in &self.relations {
            header.push_u64(table.num_rows)?;
            header.push_u64(table.columns.len() as u64)?;
            header.push_name(&table.name)?;
            for column in &table.columns {
                let bytes = (column.pages.len() * PAGE_SIZE) as u64;
                header.push_u64(column.data_type.tag())?;
                header.push_u64(cur_page)?;
                header.push_u64(cur_page + bytes)?;
                cur_page += bytes;
            }
        }
        header.buffer.resize(HEADER_SIZE, 0);

        let file = fs::File::create(&temp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header.buffer)?;
        for table in &self.relations {
            for column in &table.columns {
                for page in &column.pages {
                    writer.write_all(page.get().bytes())?;
                }
            }
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&temp, path)?;
        Ok(())
    }

    /// Load a cache file read-only; pages reference the mapping directly.
    pub fn deserialize(path: &Path) -> Result<DataSource> {
        let mapping = Mmap::map_file(path)?;
        if mapping.len() < HEADER_SIZE {
            return Err(DbError::Storage("cache file corrupted: too small".into()));
        }
        let header = unsafe { std::slice::from_raw_parts(mapping.data(), HEADER_SIZE) };
        let mut reader = HeaderReader { data: header, pos: 0 };

        if reader.read_u64()? != MARKER {
            return Err(DbError::Storage("cache file corrupted: invalid marker".into()));
        }
        let num_tables = reader.read_u64()?;
        let mut relations = Vec::with_capacity(num_tables as usize);
        for _ in 0..num_tables {
            let num_rows = reader.read_u64()?;
            let num_columns = reader.read_u64()?;
            let name = reader.read_name()?;
            let mut columns = Vec::with_capacity(num_columns as usize);
            for _ in 0..num_columns {
                let type_tag = reader.read_u64()?;
                let page_start = reader.read_u64()? as usize;
                let page_end = reader.read_u64()? as usize;
                let data_type = DataType::from_tag(type_tag).ok_or_else(|| {
                    DbError::Storage(format!("cache file corrupted: data type {type_tag}"))
                })?;
                if page_start % PAGE_SIZE != 0 || page_end % PAGE_SIZE != 0 {
                    return Err(DbError::Storage(
                        "cache file corrupted: unaligned page extent".into(),
                    ));
                }
                if page_start > page_end || page_end > mapping.len() {
                    return Err(DbError::Storage(
                        "cache file corrupted: page extent out of bounds".into(),
                    ));
                }
                let mut pages = Vec::with_capacity((page_end - page_start) / PAGE_SIZE);
                let mut cur = page_start;
                while cur < page_end {
                    pages.push(PagePtr(unsafe { mapping.data().add(cur) } as *const Page));
                    cur += PAGE_SIZE;
                }
                columns.push(TableColumn { data_type, pages });
            }
            relations.push(Table { num_rows, columns, name });
        }

        Ok(DataSource { relations, mapping: Some(mapping) })
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}
