//! Immutable lookup tables built once from tabular input.
//!
//! The tabular loader itself is an external collaborator; rows arrive here
//! as ready mappings from column name to numeric value. Tables are built
//! once, validated eagerly, and shared read-only across tasks behind an
//! `Arc`.

use std::collections::BTreeMap;

use crate::error::LookupError;

/// One row of named numeric values.
pub type Row = BTreeMap<String, f64>;

/// Hydrologic soil group, the secondary key of the nested ratio lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SoilGroup {
    A,
    B,
    C,
    D,
}

impl SoilGroup {
    pub const ALL: [SoilGroup; 4] = [Self::A, Self::B, Self::C, Self::D];

    /// Soil group rasters encode the groups as pixel values 1 through 4.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::A),
            2 => Some(Self::B),
            3 => Some(Self::C),
            4 => Some(Self::D),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
            Self::D => 4,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
            Self::D => 3,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }
}

/// Mapping from an integer category code to a record of named numeric
/// fields. Construction validates key uniqueness; the table is immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct LookupTable {
    rows: BTreeMap<i64, Row>,
}

impl LookupTable {
    /// Build a table from rows keyed by `key_column`. The key value is
    /// truncated to an integer code. Fails on a duplicate key or when a
    /// row lacks the key column itself.
    pub fn build<I>(rows: I, key_column: &str) -> Result<Self, LookupError>
    where
        I: IntoIterator<Item = Row>,
    {
        let mut map = BTreeMap::new();

        for (index, row) in rows.into_iter().enumerate() {
            let code = *row
                .get(key_column)
                .ok_or_else(|| LookupError::MissingColumn(index as i64, key_column.into()))?
                as i64;

            if map.insert(code, row).is_some() {
                return Err(LookupError::DuplicateKey(code, key_column.into()));
            }
        }

        Ok(Self { rows: map })
    }

    /// Retrieve the record for a code. Whether an unknown code is fatal is
    /// the caller's decision; reclassification defaults to nodata instead.
    pub fn get(&self, code: i64) -> Result<&Row, LookupError> {
        self.rows.get(&code).ok_or(LookupError::UnknownCode(code))
    }

    /// Retrieve one named field of the record for a code.
    pub fn field(&self, code: i64, column: &str) -> Result<f64, LookupError> {
        let row = self.get(code)?;
        row.get(column)
            .copied()
            .ok_or_else(|| LookupError::MissingColumn(code, column.into()))
    }

    /// All category codes present in the table, in ascending order.
    pub fn codes(&self) -> impl Iterator<Item = i64> + '_ {
        self.rows.keys().copied()
    }

    /// Column names starting with `prefix`, with the prefix stripped.
    /// Used to discover pollutants from `EMC_*` columns.
    pub fn suffixes_of(&self, prefix: &str) -> Vec<String> {
        let Some(row) = self.rows.values().next() else {
            return vec![];
        };

        row.keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .map(str::to_string)
            .collect()
    }

    /// Project one column into a flat code → value map, validating that
    /// every row carries it.
    pub fn project(&self, column: &str) -> Result<BTreeMap<i64, f64>, LookupError> {
        self.rows
            .iter()
            .map(|(&code, row)| {
                let value = row
                    .get(column)
                    .copied()
                    .ok_or_else(|| LookupError::MissingColumn(code, column.into()))?;
                Ok((code, value))
            })
            .collect()
    }
}

/// Nested lookup from `(category code, soil group)` to a ratio, built from
/// a column family such as `RC_A..RC_D` or `IR_A..IR_D`.
#[derive(Debug, Clone)]
pub struct SoilLookup {
    ratios: BTreeMap<i64, [f64; 4]>,
}

impl SoilLookup {
    /// `prefix` names the column family: `"RC_"` yields the ratios from
    /// columns `RC_A`, `RC_B`, `RC_C`, `RC_D`.
    pub fn from_table(table: &LookupTable, prefix: &str) -> Result<Self, LookupError> {
        let mut ratios = BTreeMap::new();

        for code in table.codes() {
            let mut entry = [0.0; 4];
            for group in SoilGroup::ALL {
                let column = format!("{prefix}{}", group.letter());
                entry[group.slot()] = table.field(code, &column)?;
            }
            ratios.insert(code, entry);
        }

        Ok(Self { ratios })
    }

    pub fn get(&self, code: i64, group: SoilGroup) -> Result<f64, LookupError> {
        self.ratios
            .get(&code)
            .map(|entry| entry[group.slot()])
            .ok_or(LookupError::UnknownCode(code))
    }

    pub fn codes(&self) -> impl Iterator<Item = i64> + '_ {
        self.ratios.keys().copied()
    }
}
