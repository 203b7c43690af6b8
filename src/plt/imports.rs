//! Undefined-symbol scanning of relocatable objects.

use hashbrown::HashSet;
use object::{Object, ObjectSymbol, SymbolKind};

use super::{PltError, PltTable};

/// Names of the undefined symbols of an object file, in symbol-table order.
pub fn undefined_symbols(data: &[u8]) -> Result<Vec<String>, PltError> {
    let file = object::File::parse(data).map_err(|e| PltError::Object(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for symbol in file.symbols() {
        if !symbol.is_undefined() || matches!(symbol.kind(), SymbolKind::Section | SymbolKind::File)
        {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        if !name.is_empty() && seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Register every undefined symbol of `data` with `table`.
pub fn register_undefined(table: &PltTable, data: &[u8]) -> Result<Vec<usize>, PltError> {
    let names = undefined_symbols(data)?;
    log::debug!("Registering {} undefined symbols lazily", names.len());
    names.iter().map(|name| table.add_symbol(name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LookupFn;
    use object::write::{Object as WriteObject, StandardSection, Symbol, SymbolSection};
    use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolScope};
    use std::sync::Arc;

    fn sample_object(undefined: &[&str]) -> Vec<u8> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        let main = obj.add_symbol(Symbol {
            name: b"main".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        obj.add_symbol_data(main, text, &[0xC3], 16);

        for name in undefined {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Text,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
        }
        obj.write().unwrap()
    }

    #[test]
    fn test_lists_only_undefined() {
        let data = sample_object(&["puts", "malloc"]);
        let names = undefined_symbols(&data).unwrap();
        assert_eq!(names, vec!["puts".to_string(), "malloc".to_string()]);
    }

    #[test]
    fn test_register_undefined() {
        let table = PltTable::new(Arc::new(LookupFn(|_: &str| None)), true, 0);
        table.add_symbol("malloc").unwrap();
        let data = sample_object(&["puts", "malloc"]);

        let indices = register_undefined(&table, &data).unwrap();
        assert_eq!(indices, vec![1, 0]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            undefined_symbols(b"not an object"),
            Err(PltError::Object(_))
        ));
    }
}
