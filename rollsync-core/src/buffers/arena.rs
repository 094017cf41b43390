//! Pre-allocated shared memory holding a `rows x cols` grid of records.
//!
//! Every field lives in its own region laid out row major, `[row][col][width]`, so a contiguous
//! range of columns in one row is a contiguous slice. The region is an anonymous shared mapping
//! created once by the master, every party only ever holds an `Arc` to it.
//!
//! Writers go through a [`ColumnView`]. Views are claimed for a column range and a set of fields,
//! and two live claims may never overlap in both. This is the only thing that makes concurrent
//! writes sound, readers outside a view rely on the round protocol to not observe a region while
//! it is being written.

use crate::{
    buffers::schema::{DType, FieldKind, FieldSchema, FieldSet, FieldSpec, Rows},
    error::{Result, SamplerError},
};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

const REGION_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Region {
    spec: FieldSpec,
    rows: usize,
    offset: usize,
}

#[derive(Debug, Clone)]
struct Claim {
    id: u64,
    cols: Range<usize>,
    fields: FieldSet,
}

pub struct SharedArena {
    _map: MmapMut,
    base: *mut u8,
    len: usize,
    rows: usize,
    cols: usize,
    schema: FieldSchema,
    regions: Vec<Region>,
    claims: Mutex<Vec<Claim>>,
    next_claim: AtomicU64,
}

// SAFETY: the mapping lives as long as the arena and `base` is never reassigned. Mutable access to
// the bytes is only handed out through non overlapping `ColumnView` claims.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    pub fn allocate(rows: usize, cols: usize, schema: FieldSchema) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(SamplerError::setup(format!(
                "cannot allocate a {rows}x{cols} shared region"
            )));
        }
        let mut offset: usize = 0;
        let mut regions = vec![];
        for spec in schema.fields().iter().filter(|spec| spec.width > 0) {
            let region_rows = match spec.rows {
                Rows::PerStep => rows,
                Rows::Trailing => 1,
            };
            offset = offset.next_multiple_of(REGION_ALIGN);
            regions.push(Region {
                spec: *spec,
                rows: region_rows,
                offset,
            });
            offset += region_rows * cols * spec.width * spec.dtype.size();
        }
        let len = offset.max(1);
        let mut map = MmapMut::map_anon(len)?;
        let base = map.as_mut_ptr();
        debug!(rows, cols, bytes = len, "allocated shared region");
        Ok(Self {
            _map: map,
            base,
            len,
            rows,
            cols,
            schema,
            regions,
            claims: Mutex::new(vec![]),
            next_claim: AtomicU64::new(0),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    fn region(&self, kind: FieldKind, dtype: DType) -> Option<&Region> {
        let region = self.regions.iter().find(|r| r.spec.kind == kind)?;
        assert_eq!(
            region.spec.dtype, dtype,
            "field {kind:?} accessed with the wrong element type"
        );
        Some(region)
    }

    // Returns the byte offset and element count of `cols` in `row` of a region.
    fn span_bounds(&self, region: &Region, row: usize, cols: &Range<usize>) -> (usize, usize) {
        assert!(
            row < region.rows,
            "row {row} out of bounds for {:?} with {} rows",
            region.spec.kind,
            region.rows
        );
        assert!(
            cols.start <= cols.end && cols.end <= self.cols,
            "columns {cols:?} out of bounds for {} columns",
            self.cols
        );
        let width = region.spec.width;
        let start = region.offset + (row * self.cols + cols.start) * width * region.spec.dtype.size();
        (start, cols.len() * width)
    }

    pub fn f32_span(&self, kind: FieldKind, row: usize, cols: Range<usize>) -> &[f32] {
        let Some(region) = self.region(kind, DType::F32) else {
            return &[];
        };
        let (start, len) = self.span_bounds(region, row, &cols);
        // SAFETY: bounds checked above, region offsets are 64 byte aligned inside a page aligned
        // mapping so the pointer is aligned for f32.
        unsafe { std::slice::from_raw_parts(self.base.add(start) as *const f32, len) }
    }

    pub fn f32_cell(&self, kind: FieldKind, row: usize, col: usize) -> &[f32] {
        self.f32_span(kind, row, col..col + 1)
    }

    /// The whole region of a field, `[rows][cols][width]`.
    pub fn f32_field(&self, kind: FieldKind) -> &[f32] {
        let Some(region) = self.region(kind, DType::F32) else {
            return &[];
        };
        let len = region.rows * self.cols * region.spec.width;
        // SAFETY: the region was sized to exactly `len` elements at allocation.
        unsafe { std::slice::from_raw_parts(self.base.add(region.offset) as *const f32, len) }
    }

    pub fn u8_span(&self, kind: FieldKind, row: usize, cols: Range<usize>) -> &[u8] {
        let Some(region) = self.region(kind, DType::U8) else {
            return &[];
        };
        let (start, len) = self.span_bounds(region, row, &cols);
        // SAFETY: bounds checked above.
        unsafe { std::slice::from_raw_parts(self.base.add(start) as *const u8, len) }
    }

    pub fn u8_field(&self, kind: FieldKind) -> &[u8] {
        let Some(region) = self.region(kind, DType::U8) else {
            return &[];
        };
        let len = region.rows * self.cols * region.spec.width;
        // SAFETY: the region was sized to exactly `len` elements at allocation.
        unsafe { std::slice::from_raw_parts(self.base.add(region.offset) as *const u8, len) }
    }

    // SAFETY: the caller must hold a claim covering `kind` and `cols`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn f32_span_mut(&self, kind: FieldKind, row: usize, cols: Range<usize>) -> &mut [f32] {
        let Some(region) = self.region(kind, DType::F32) else {
            return &mut [];
        };
        let (start, len) = self.span_bounds(region, row, &cols);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(start) as *mut f32, len) }
    }

    // SAFETY: the caller must hold a claim covering `kind` and `cols`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn u8_span_mut(&self, kind: FieldKind, row: usize, cols: Range<usize>) -> &mut [u8] {
        let Some(region) = self.region(kind, DType::U8) else {
            return &mut [];
        };
        let (start, len) = self.span_bounds(region, row, &cols);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(start), len) }
    }

    /// Claims write access to `fields` of the columns in `cols`. Fails if any live claim shares
    /// both a column and a field with the request.
    pub fn claim(self: &Arc<Self>, cols: Range<usize>, fields: FieldSet) -> Result<ColumnView> {
        if cols.start >= cols.end || cols.end > self.cols {
            return Err(SamplerError::Partition(format!(
                "column range {cols:?} is empty or exceeds {} columns",
                self.cols
            )));
        }
        let mut claims = self.claims.lock();
        if let Some(conflict) = claims
            .iter()
            .find(|c| c.cols.start < cols.end && cols.start < c.cols.end && c.fields.intersects(&fields))
        {
            return Err(SamplerError::Partition(format!(
                "columns {cols:?} overlap the live claim on {:?}",
                conflict.cols
            )));
        }
        let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
        claims.push(Claim {
            id,
            cols: cols.clone(),
            fields,
        });
        Ok(ColumnView {
            arena: self.clone(),
            cols,
            fields,
            claim_id: id,
        })
    }

    fn release(&self, claim_id: u64) {
        self.claims.lock().retain(|c| c.id != claim_id);
    }
}

/// Exclusive write access to some fields of a contiguous column range. All column indices taken
/// by the view are local to the range.
pub struct ColumnView {
    arena: Arc<SharedArena>,
    cols: Range<usize>,
    fields: FieldSet,
    claim_id: u64,
}

impl ColumnView {
    pub fn cols(&self) -> Range<usize> {
        self.cols.clone()
    }

    pub fn n_cols(&self) -> usize {
        self.cols.len()
    }

    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    fn local(&self, col: usize) -> Range<usize> {
        assert!(col < self.cols.len(), "local column {col} outside {:?}", self.cols);
        self.cols.start + col..self.cols.start + col + 1
    }

    fn check_writable(&self, kind: FieldKind) {
        assert!(
            self.fields.contains(kind),
            "view over {:?} does not own field {kind:?}",
            self.cols
        );
    }

    pub fn span(&self, kind: FieldKind, row: usize) -> &[f32] {
        self.arena.f32_span(kind, row, self.cols.clone())
    }

    pub fn cell(&self, kind: FieldKind, row: usize, col: usize) -> &[f32] {
        self.arena.f32_span(kind, row, self.local(col))
    }

    pub fn flags(&self, kind: FieldKind, row: usize) -> &[u8] {
        self.arena.u8_span(kind, row, self.cols.clone())
    }

    pub fn span_mut(&mut self, kind: FieldKind, row: usize) -> &mut [f32] {
        self.check_writable(kind);
        // SAFETY: this view holds the claim on `kind` for these columns.
        unsafe { self.arena.f32_span_mut(kind, row, self.cols.clone()) }
    }

    pub fn write(&mut self, kind: FieldKind, row: usize, col: usize, values: &[f32]) {
        self.check_writable(kind);
        let cols = self.local(col);
        // SAFETY: this view holds the claim on `kind` for these columns.
        let cell = unsafe { self.arena.f32_span_mut(kind, row, cols) };
        assert_eq!(
            cell.len(),
            values.len(),
            "field {kind:?} expects {} values",
            cell.len()
        );
        cell.copy_from_slice(values);
    }

    pub fn fill(&mut self, kind: FieldKind, row: usize, col: usize, value: f32) {
        self.check_writable(kind);
        let cols = self.local(col);
        // SAFETY: this view holds the claim on `kind` for these columns.
        unsafe { self.arena.f32_span_mut(kind, row, cols) }.fill(value);
    }

    pub fn set_flag(&mut self, kind: FieldKind, row: usize, col: usize, value: bool) {
        self.check_writable(kind);
        let cols = self.local(col);
        // SAFETY: this view holds the claim on `kind` for these columns.
        unsafe { self.arena.u8_span_mut(kind, row, cols) }.fill(value as u8);
    }

    pub fn flags_mut(&mut self, kind: FieldKind, row: usize) -> &mut [u8] {
        self.check_writable(kind);
        // SAFETY: this view holds the claim on `kind` for these columns.
        unsafe { self.arena.u8_span_mut(kind, row, self.cols.clone()) }
    }
}

impl Drop for ColumnView {
    fn drop(&mut self) {
        self.arena.release(self.claim_id);
    }
}
