//! Physical plan IR consumed by the engine, plus row-wise conversion
//! helpers for tests and tools.
//!
//! A plan is a DAG of scan and hash-join nodes over columnar input
//! tables; each node projects and orders its output columns through
//! `output_attrs`.

use crate::memory::page_pool;
use crate::storage::column::DataType;
use crate::storage::page::{Page, PagePtr, PAGE_SIZE};

#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Int32(i32),
    Int64(i64),
    Fp64(f64),
    Str(String),
    Null,
}

pub struct Column {
    pub data_type: DataType,
    pub pages: Vec<*mut Page>,
}

unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    pub fn new(data_type: DataType) -> Column {
        Column { data_type, pages: Vec::new() }
    }

    pub fn new_page(&mut self) -> *mut Page {
        let page = page_pool::allocate_page();
        unsafe { (*page).zero() };
        self.pages.push(page);
        page
    }

    pub fn page_ptrs(&self) -> Vec<PagePtr> {
        self.pages.iter().map(|&p| PagePtr(p)).collect()
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        for &page in &self.pages {
            page_pool::free_page(page);
        }
    }
}

/// Materialized column-oriented table; owns its pages.
#[derive(Default)]
pub struct ColumnarTable {
    pub num_rows: usize,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanNode {
    pub base_table_id: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct JoinNode {
    pub build_left: bool,
    pub left: usize,
    pub right: usize,
    pub left_attr: usize,
    pub right_attr: usize,
}

pub enum NodeKind {
    Scan(ScanNode),
    Join(JoinNode),
}

pub struct PlanNode {
    pub kind: NodeKind,
    pub output_attrs: Vec<(usize, DataType)>,
}

#[derive(Default)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
    pub inputs: Vec<ColumnarTable>,
    pub root: usize,
}

impl Plan {
    pub fn new_scan_node(
        &mut self,
        base_table_id: usize,
        output_attrs: Vec<(usize, DataType)>,
    ) -> usize {
        self.nodes.push(PlanNode { kind: NodeKind::Scan(ScanNode { base_table_id }), output_attrs });
        self.nodes.len() - 1
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_join_node(
        &mut self,
        build_left: bool,
        left: usize,
        right: usize,
        left_attr: usize,
        right_attr: usize,
        output_attrs: Vec<(usize, DataType)>,
    ) -> usize {
        self.nodes.push(PlanNode {
            kind: NodeKind::Join(JoinNode { build_left, left, right, left_attr, right_attr }),
            output_attrs,
        });
        self.nodes.len() - 1
    }

    pub fn new_input(&mut self, input: ColumnarTable) -> usize {
        self.inputs.push(input);
        self.inputs.len() - 1
    }
}

// ---------------------------------------------------------------------------
// Row-wise construction (tests and tools)
// ---------------------------------------------------------------------------

struct FixedInserter {
    elem_size: usize,
    num_rows: u16,
    data_end: usize,
    bitmap: [u8; PAGE_SIZE],
}

impl FixedInserter {
    fn new(elem_size: usize) -> FixedInserter {
        FixedInserter {
            elem_size,
            num_rows: 0,
            data_end: Page::data_offset(elem_size),
            bitmap: [0; PAGE_SIZE],
        }
    }

    fn save_page(&mut self, column: &mut Column) {
        let page = *column.pages.last().unwrap();
        let page = unsafe { &mut *page };
        page.set_num_rows(self.num_rows);
        page.set_num_not_null(
            ((self.data_end - Page::data_offset(self.elem_size)) / self.elem_size) as u16,
        );
        let bitmap_size = (self.num_rows as usize + 7) / 8;
        page.bytes_mut()[PAGE_SIZE - bitmap_size..].copy_from_slice(&self.bitmap[..bitmap_size]);
        self.num_rows = 0;
        self.data_end = Page::data_offset(self.elem_size);
    }

    fn current_page<'a>(&mut self, column: &'a mut Column) -> &'a mut Page {
        if self.num_rows == 0 && self.data_end == Page::data_offset(self.elem_size) {
            if column.pages.is_empty() || unsafe { (**column.pages.last().unwrap()).num_rows() } > 0
            {
                column.new_page();
            }
        }
        unsafe { &mut **column.pages.last().unwrap() }
    }

    fn insert(&mut self, column: &mut Column, raw: u64) {
        if self.data_end + self.elem_size + self.num_rows as usize / 8 + 1 > PAGE_SIZE {
            self.save_page(column);
        }
        let data_end = self.data_end;
        let elem_size = self.elem_size;
        let page = self.current_page(column);
        page.bytes_mut()[data_end..data_end + elem_size]
            .copy_from_slice(&raw.to_le_bytes()[..elem_size]);
        self.data_end += elem_size;
        self.bitmap[self.num_rows as usize / 8] |= 1 << (self.num_rows % 8);
        self.num_rows += 1;
    }

    fn insert_null(&mut self, column: &mut Column) {
        if self.data_end + self.num_rows as usize / 8 + 1 > PAGE_SIZE {
            self.save_page(column);
        }
        self.current_page(column);
        self.bitmap[self.num_rows as usize / 8] &= !(1 << (self.num_rows % 8));
        self.num_rows += 1;
    }

    fn finalize(&mut self, column: &mut Column) {
        if self.num_rows != 0 {
            self.save_page(column);
        }
    }
}

struct StringInserter {
    num_rows: u16,
    data_size: usize,
    offset_end: usize,
    data: [u8; PAGE_SIZE],
    bitmap: [u8; PAGE_SIZE],
}

impl StringInserter {
    const OFFSET_BEGIN: usize = 4;

    fn new() -> StringInserter {
        StringInserter {
            num_rows: 0,
            data_size: 0,
            offset_end: Self::OFFSET_BEGIN,
            data: [0; PAGE_SIZE],
            bitmap: [0; PAGE_SIZE],
        }
    }

    fn current_page<'a>(&mut self, column: &'a mut Column) -> &'a mut Page {
        if self.num_rows == 0 && self.offset_end == Self::OFFSET_BEGIN {
            let needs_page = match column.pages.last() {
                None => true,
                Some(&page) => unsafe { (*page).num_rows() > 0 },
            };
            if needs_page {
                column.new_page();
            }
        }
        unsafe { &mut **column.pages.last().unwrap() }
    }

    fn save_page(&mut self, column: &mut Column) {
        let num_not_null = ((self.offset_end - Self::OFFSET_BEGIN) / 2) as u16;
        let data_size = self.data_size;
        let num_rows = self.num_rows;
        let page = self.current_page(column);
        page.set_num_rows(num_rows);
        page.set_num_not_null(num_not_null);
        let strings_at = Self::OFFSET_BEGIN + num_not_null as usize * 2;
        page.bytes_mut()[strings_at..strings_at + data_size]
            .copy_from_slice(&self.data[..data_size]);
        let bitmap_size = (num_rows as usize + 7) / 8;
        page.bytes_mut()[PAGE_SIZE - bitmap_size..].copy_from_slice(&self.bitmap[..bitmap_size]);
        self.num_rows = 0;
        self.data_size = 0;
        self.offset_end = Self::OFFSET_BEGIN;
    }

    fn save_long_string(&mut self, column: &mut Column, value: &[u8]) {
        let mut offset = 0;
        let mut first = true;
        while offset < value.len() {
            let page = unsafe { &mut *column.new_page() };
            page.set_num_rows(if first { 0xFFFF } else { 0xFFFE });
            first = false;
            let chunk = (value.len() - offset).min(PAGE_SIZE - 4);
            page.set_num_not_null(chunk as u16);
            page.bytes_mut()[4..4 + chunk].copy_from_slice(&value[offset..offset + chunk]);
            offset += chunk;
        }
    }

    fn insert(&mut self, column: &mut Column, value: &[u8]) {
        if value.len() > PAGE_SIZE - 7 {
            if self.num_rows > 0 {
                self.save_page(column);
            }
            self.save_long_string(column, value);
        } else {
            if self.offset_end + 2 + self.data_size + value.len() + self.num_rows as usize / 8 + 1
                > PAGE_SIZE
            {
                self.save_page(column);
            }
            self.current_page(column);
            self.data[self.data_size..self.data_size + value.len()].copy_from_slice(value);
            self.data_size += value.len();
            let offset_end = self.offset_end;
            let data_size = self.data_size as u16;
            let page = self.current_page(column);
            page.bytes_mut()[offset_end..offset_end + 2].copy_from_slice(&data_size.to_le_bytes());
            self.offset_end += 2;
            self.bitmap[self.num_rows as usize / 8] |= 1 << (self.num_rows % 8);
            self.num_rows += 1;
        }
    }

    fn insert_null(&mut self, column: &mut Column) {
        if self.offset_end + self.data_size + self.num_rows as usize / 8 + 1 > PAGE_SIZE {
            self.save_page(column);
        }
        self.current_page(column);
        self.bitmap[self.num_rows as usize / 8] &= !(1 << (self.num_rows % 8));
        self.num_rows += 1;
    }

    fn finalize(&mut self, column: &mut Column) {
        if self.num_rows != 0 {
            self.save_page(column);
        }
    }
}

/// Build a columnar table from row-major data.
pub fn from_rows(rows: &[Vec<Data>], types: &[DataType]) -> ColumnarTable {
    let mut table = ColumnarTable { num_rows: rows.len(), columns: Vec::new() };
    for (col_index, &data_type) in types.iter().enumerate() {
        let mut column = Column::new(data_type);
        match data_type {
            DataType::Int32 => {
                let mut inserter = FixedInserter::new(4);
                for row in rows {
                    match &row[col_index] {
                        Data::Int32(v) => inserter.insert(&mut column, *v as u32 as u64),
                        Data::Null => inserter.insert_null(&mut column),
                        other => panic!("type mismatch in column {col_index}: {other:?}"),
                    }
                }
                inserter.finalize(&mut column);
            }
            DataType::Int64 => {
                let mut inserter = FixedInserter::new(8);
                for row in rows {
                    match &row[col_index] {
                        Data::Int64(v) => inserter.insert(&mut column, *v as u64),
                        Data::Null => inserter.insert_null(&mut column),
                        other => panic!("type mismatch in column {col_index}: {other:?}"),
                    }
                }
                inserter.finalize(&mut column);
            }
            DataType::Fp64 => {
                let mut inserter = FixedInserter::new(8);
                for row in rows {
                    match &row[col_index] {
                        Data::Fp64(v) => inserter.insert(&mut column, v.to_bits()),
                        Data::Null => inserter.insert_null(&mut column),
                        other => panic!("type mismatch in column {col_index}: {other:?}"),
                    }
                }
                inserter.finalize(&mut column);
            }
            DataType::Varchar => {
                let mut inserter = StringInserter::new();
                for row in rows {
                    match &row[col_index] {
                        Data::Str(s) => inserter.insert(&mut column, s.as_bytes()),
                        Data::Null => inserter.insert_null(&mut column),
                        other => panic!("type mismatch in column {col_index}: {other:?}"),
                    }
                }
                inserter.finalize(&mut column);
            }
        }
        table.columns.push(column);
    }
    table
}

/// Read a columnar table back into row-major data.
pub fn to_rows(table: &ColumnarTable) -> Vec<Vec<Data>> {
    let mut rows = vec![Vec::with_capacity(table.columns.len()); table.num_rows];
    for column in &table.columns {
        let mut row_index = 0usize;
        let mut page_index = 0usize;
        while page_index < column.pages.len() {
            let page = unsafe { &*column.pages[page_index] };
            if page.is_long_string_start() {
                let mut value = Vec::new();
                value.extend_from_slice(page.long_string());
                page_index += 1;
                while page_index < column.pages.len() {
                    let cont = unsafe { &*column.pages[page_index] };
                    if !cont.is_long_string_continuation() {
                        break;
                    }
                    value.extend_from_slice(cont.long_string());
                    page_index += 1;
                }
                rows[row_index].push(Data::Str(String::from_utf8_lossy(&value).into_owned()));
                row_index += 1;
                continue;
            }
            let mut non_null = 0usize;
            for i in 0..page.num_rows() as usize {
                if page.is_null(i) {
                    rows[row_index].push(Data::Null);
                } else {
                    let value = match column.data_type {
                        DataType::Int32 => Data::Int32(page.value::<u32>(non_null) as i32),
                        DataType::Int64 => Data::Int64(page.value::<u64>(non_null) as i64),
                        DataType::Fp64 => Data::Fp64(f64::from_bits(page.value::<u64>(non_null))),
                        DataType::Varchar => {
                            let end = page.value::<u16>(non_null) as usize;
                            let start = if non_null == 0 {
                                0
                            } else {
                                page.value::<u16>(non_null - 1) as usize
                            };
                            let strings = page.strings_ptr();
                            let bytes = unsafe {
                                std::slice::from_raw_parts(strings.add(start), end - start)
                            };
                            Data::Str(String::from_utf8_lossy(bytes).into_owned())
                        }
                    };
                    rows[row_index].push(value);
                    non_null += 1;
                }
                row_index += 1;
            }
            page_index += 1;
        }
        debug_assert_eq!(row_index, table.num_rows, "column shorter than table");
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        let rows = vec![
            vec![Data::Int32(1), Data::Int64(100)],
            vec![Data::Null, Data::Int64(-5)],
            vec![Data::Int32(-7), Data::Null],
        ];
        let table = from_rows(&rows, &[DataType::Int32, DataType::Int64]);
        assert_eq!(table.num_rows, 3);
        assert_eq!(to_rows(&table), rows);
    }

    #[test]
    fn test_string_roundtrip() {
        let rows = vec![
            vec![Data::Str("hello".into())],
            vec![Data::Null],
            vec![Data::Str(String::new())],
            vec![Data::Str("a longer string value".into())],
        ];
        let table = from_rows(&rows, &[DataType::Varchar]);
        assert_eq!(to_rows(&table), rows);
    }

    #[test]
    fn test_long_string_roundtrip() {
        let long = "x".repeat(PAGE_SIZE * 2 + 100);
        let rows = vec![
            vec![Data::Str("before".into())],
            vec![Data::Str(long.clone())],
            vec![Data::Str("after".into())],
        ];
        let table = from_rows(&rows, &[DataType::Varchar]);
        let back = to_rows(&table);
        assert_eq!(back[0], rows[0]);
        assert_eq!(back[1], vec![Data::Str(long)]);
        assert_eq!(back[2], rows[2]);
    }

    #[test]
    fn test_many_rows_cross_pages() {
        let rows: Vec<Vec<Data>> = (0..5000).map(|i| vec![Data::Int32(i)]).collect();
        let table = from_rows(&rows, &[DataType::Int32]);
        assert!(table.columns[0].pages.len() > 1);
        assert_eq!(to_rows(&table), rows);
    }

    #[test]
    fn test_fp64_roundtrip() {
        let rows = vec![vec![Data::Fp64(1.5)], vec![Data::Fp64(-0.25)], vec![Data::Null]];
        let table = from_rows(&rows, &[DataType::Fp64]);
        assert_eq!(to_rows(&table), rows);
    }
}
