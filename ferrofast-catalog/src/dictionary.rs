/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Initial dictionary state.
//!
//! The factory expands a catalog's default tables into dense per-slot
//! initial values, used to seed a codec's dictionaries and to re-seed them
//! on full reset. Per-message reset groups are applied from the catalog's
//! [`ResetEntry`](crate::ResetEntry) lists instead; this type only answers
//! "what does slot N start as".

use crate::catalog::Catalog;

/// Dense initial values for the three dictionaries of one catalog.
#[derive(Debug, Clone)]
pub struct DictionaryFactory {
    int_init: Vec<i32>,
    int_defined: Vec<bool>,
    long_init: Vec<i64>,
    long_defined: Vec<bool>,
    bytes_init: Vec<Option<u32>>,
}

impl DictionaryFactory {
    /// Expands the catalog's default tables.
    #[must_use]
    pub fn new(catalog: &Catalog) -> Self {
        let mut factory = Self {
            int_init: vec![0; catalog.int_dict_size() as usize],
            int_defined: vec![false; catalog.int_dict_size() as usize],
            long_init: vec![0; catalog.long_dict_size() as usize],
            long_defined: vec![false; catalog.long_dict_size() as usize],
            bytes_init: vec![None; catalog.bytes_dict_size() as usize],
        };
        for &(slot, value) in catalog.int_defaults() {
            factory.int_init[slot as usize] = value;
            factory.int_defined[slot as usize] = true;
        }
        for &(slot, value) in catalog.long_defaults() {
            factory.long_init[slot as usize] = value;
            factory.long_defined[slot as usize] = true;
        }
        for &(slot, const_index) in catalog.bytes_initials() {
            factory.bytes_init[slot as usize] = Some(const_index);
        }
        factory
    }

    /// Initial value of an int32 slot.
    #[must_use]
    pub fn int_initial(&self, slot: u32) -> i32 {
        self.int_init[slot as usize]
    }

    /// True when the int32 slot has a declared initial value.
    #[must_use]
    pub fn int_has_initial(&self, slot: u32) -> bool {
        self.int_defined[slot as usize]
    }

    /// Initial value of an int64 slot.
    #[must_use]
    pub fn long_initial(&self, slot: u32) -> i64 {
        self.long_init[slot as usize]
    }

    /// True when the int64 slot has a declared initial value.
    #[must_use]
    pub fn long_has_initial(&self, slot: u32) -> bool {
        self.long_defined[slot as usize]
    }

    /// Constant-pool index seeding a byte slot, if declared.
    #[must_use]
    pub fn bytes_initial(&self, slot: u32) -> Option<u32> {
        self.bytes_init[slot as usize]
    }

    /// Slot counts as `(int, long, bytes)`.
    #[must_use]
    pub fn sizes(&self) -> (usize, usize, usize) {
        (
            self.int_init.len(),
            self.long_init.len(),
            self.bytes_init.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::build_catalog;

    #[test]
    fn test_factory_expands_defaults() {
        let xml = r#"
<templates>
  <template name="T" id="1">
    <uInt32 name="A"><copy value="5"/></uInt32>
    <uInt32 name="B"><copy/></uInt32>
    <uInt64 name="C"><delta value="-3"/></uInt64>
    <string name="S"><constant value="ACME"/></string>
  </template>
</templates>
"#;
        let catalog = build_catalog(xml).unwrap();
        let factory = DictionaryFactory::new(&catalog);
        assert_eq!(factory.sizes(), (2, 1, 1));
        assert_eq!(factory.int_initial(0), 5);
        assert!(factory.int_has_initial(0));
        assert!(!factory.int_has_initial(1));
        assert_eq!(factory.long_initial(0), -3);
        let const_index = factory.bytes_initial(0).unwrap();
        assert_eq!(catalog.constants()[const_index as usize], b"ACME");
    }
}
