use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Collection plate layout of the cutting instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellPlate {
    pub rows: usize,
    pub columns: usize,
}

impl Default for WellPlate {
    fn default() -> Self {
        Self {
            rows: 8,
            columns: 12,
        }
    }
}

impl WellPlate {
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.columns == 0 {
            return Err(Error::invalid("plate", "needs at least one row and column"));
        }
        if self.rows > 26 {
            return Err(Error::invalid("plate", "rows are lettered A-Z"));
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.rows * self.columns
    }

    /// Row letter and 1-based column, e.g. `A1`, `B3`.
    pub fn label(&self, index: usize) -> String {
        let row = index / self.columns;
        let column = index % self.columns;
        format!("{}{}", char::from(b'A' + row as u8), column + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Well {
    /// Row-major index on the plate.
    pub index: usize,
    pub label: String,
}

/// Hands out wells with one empty slot after each, in both directions: every
/// second column, and every second row once a row is used up.
#[derive(Debug, Clone)]
pub struct WellAllocator {
    plate: WellPlate,
    row: usize,
    column: usize,
}

const SPREAD: usize = 2;

impl WellAllocator {
    pub fn new(plate: WellPlate) -> Self {
        Self {
            plate,
            row: 0,
            column: 0,
        }
    }

    pub fn plate(&self) -> &WellPlate {
        &self.plate
    }

    /// Next free well, or `None` once the plate is full.
    pub fn allocate(&mut self) -> Option<Well> {
        if self.row >= self.plate.rows {
            return None;
        }
        let index = self.row * self.plate.columns + self.column;
        self.column += SPREAD;
        if self.column >= self.plate.columns {
            self.column %= self.plate.columns;
            self.row += SPREAD;
        }
        Some(Well {
            index,
            label: self.plate.label(index),
        })
    }
}
