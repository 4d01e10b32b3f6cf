use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::catalog::{Catalog, CatalogEntry, DatHeader, FileSpec};
use crate::checksum::{normalize_crc32, normalize_sha1};
use crate::error::{EngineError, Result};

/// Child element whose text is being captured.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TextField {
    HeaderName,
    HeaderDescription,
    HeaderVersion,
    HeaderAuthor,
    HeaderDate,
    HeaderHomepage,
    Description,
    Manufacturer,
    Year,
    Category,
}

pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let bytes = std::fs::read(path).map_err(|e| {
        EngineError::catalog("datafile", format!("unable to read {}: {e}", path.display()))
    })?;
    let text = String::from_utf8_lossy(&bytes);
    parse_catalog(&text)
}

/// Parse an XML DAT into a [`Catalog`]. References between entries are kept
/// as names and are not checked here.
pub fn parse_catalog(xml: &str) -> Result<Catalog> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut catalog = Catalog::default();
    let mut header = DatHeader::default();
    let mut in_header = false;
    let mut current: Option<CatalogEntry> = None;
    let mut field: Option<TextField> = None;
    let mut last_element = String::from("datafile");

    loop {
        let event = reader.read_event().map_err(|e| {
            EngineError::catalog(
                last_element.clone(),
                format!("at byte {}: {e}", reader.buffer_position()),
            )
        })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = element_name(e);
                last_element = name.clone();
                match name.as_str() {
                    "header" => in_header = !is_empty,
                    "game" | "machine" => {
                        if let Some(open) = &current {
                            return Err(EngineError::catalog(
                                name,
                                format!("nested inside set {}", open.name),
                            ));
                        }
                        let entry = start_entry(e, &name)?;
                        if is_empty {
                            finish_entry(&mut catalog, entry)?;
                        } else {
                            current = Some(entry);
                        }
                    }
                    "rom" => {
                        let Some(entry) = current.as_mut() else {
                            return Err(EngineError::catalog("rom", "appears outside a set"));
                        };
                        let spec = parse_rom(e, &entry.name)?;
                        entry.files.push(spec);
                    }
                    other if !is_empty => {
                        field = text_field(other, in_header, current.is_some());
                    }
                    _ => {}
                }
            }
            Event::Text(e) => {
                if let Some(target) = field {
                    let value = e
                        .unescape()
                        .map_err(|err| EngineError::catalog(last_element.clone(), err.to_string()))?
                        .trim()
                        .to_string();
                    if !value.is_empty() {
                        store_text(target, value, &mut header, current.as_mut());
                    }
                }
            }
            Event::End(e) => {
                field = None;
                match e.name().as_ref() {
                    b"header" => in_header = false,
                    b"game" | b"machine" => {
                        if let Some(entry) = current.take() {
                            finish_entry(&mut catalog, entry)?;
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = current {
        return Err(EngineError::catalog(
            "game",
            format!("set {} is not closed", open.name),
        ));
    }

    catalog.header = header;
    Ok(catalog)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn attributes(e: &BytesStart<'_>, element: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| EngineError::catalog(element, err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
        let value = attr
            .unescape_value()
            .map_err(|err| EngineError::catalog(element, err.to_string()))?
            .to_string();
        out.push((key, value));
    }
    Ok(out)
}

fn yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes") || value == "1" || value.eq_ignore_ascii_case("true")
}

fn start_entry(e: &BytesStart<'_>, element: &str) -> Result<CatalogEntry> {
    let mut name = None;
    let mut entry = CatalogEntry::new(String::new());
    let mut explicit_bios = None;

    for (key, value) in attributes(e, element)? {
        match key.as_str() {
            "name" => name = Some(value),
            "cloneof" => entry.parent_name = Some(value),
            "romof" => entry.rom_of = Some(value),
            "bios" => explicit_bios = Some(value),
            "isbios" => entry.is_bios = yes(&value),
            "isdevice" => entry.is_device = yes(&value),
            "runnable" => entry.runnable = !value.eq_ignore_ascii_case("no"),
            "sourcefile" => entry.source_file = Some(value),
            _ => {}
        }
    }

    entry.name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| EngineError::catalog(element, "missing name attribute"))?;

    // romof names the BIOS unless it only repeats the parent.
    let bios = explicit_bios.filter(|b| !b.is_empty()).or_else(|| {
        entry
            .rom_of
            .clone()
            .filter(|r| !r.is_empty() && entry.parent_name.as_deref() != Some(r.as_str()))
    });
    if let Some(bios) = bios.filter(|b| *b != entry.name) {
        entry.bios = Some(FileSpec::bios_requirement(bios.clone()));
        entry.bios_requirement = Some(bios);
    }

    Ok(entry)
}

fn finish_entry(catalog: &mut Catalog, entry: CatalogEntry) -> Result<()> {
    catalog.insert(entry).map_err(|dup| {
        EngineError::catalog("game", format!("duplicate set name {}", dup.name))
    })
}

fn parse_rom(e: &BytesStart<'_>, set_name: &str) -> Result<FileSpec> {
    let fail = |msg: String| EngineError::catalog("rom", format!("in set {set_name}: {msg}"));

    let mut name = None;
    let mut size = None;
    let mut crc = None;
    let mut sha1 = None;
    let mut merge = None;
    let mut sub_path = None;
    let mut nodump = false;

    for (key, value) in attributes(e, "rom")? {
        match key.as_str() {
            "name" => name = Some(value),
            "size" => {
                let parsed = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| fail(format!("size {value:?} is not a number")))?;
                size = Some(parsed);
            }
            "crc" => crc = Some(value),
            "sha1" => sha1 = Some(value),
            "merge" => merge = Some(value),
            "subpath" => sub_path = Some(value),
            "status" => nodump = value.eq_ignore_ascii_case("nodump"),
            _ => {}
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| fail("missing name attribute".to_string()))?;
    let size = size.ok_or_else(|| fail(format!("{name} has no size")))?;

    let crc32 = match crc {
        Some(raw) => {
            normalize_crc32(&raw).ok_or_else(|| fail(format!("{name} has invalid crc {raw:?}")))?
        }
        None if nodump => String::new(),
        None => return Err(fail(format!("{name} has no crc"))),
    };

    let mut spec = FileSpec::new(name, size, crc32);
    spec.nodump = nodump;
    if let Some(raw) = sha1.filter(|s| !s.is_empty()) {
        let normalized =
            normalize_sha1(&raw).ok_or_else(|| fail(format!("invalid sha1 {raw:?}")))?;
        spec = spec.with_sha1(normalized);
    }
    if let Some(merge) = merge.filter(|m| !m.is_empty()) {
        spec = spec.with_merge(merge);
    }
    if let Some(sub_path) = sub_path {
        spec = spec.with_sub_path(sub_path);
    }
    Ok(spec)
}

fn text_field(element: &str, in_header: bool, in_entry: bool) -> Option<TextField> {
    if in_header {
        return match element {
            "name" => Some(TextField::HeaderName),
            "description" => Some(TextField::HeaderDescription),
            "version" => Some(TextField::HeaderVersion),
            "author" => Some(TextField::HeaderAuthor),
            "date" => Some(TextField::HeaderDate),
            "homepage" => Some(TextField::HeaderHomepage),
            _ => None,
        };
    }
    if !in_entry {
        return None;
    }
    match element {
        "description" => Some(TextField::Description),
        "manufacturer" => Some(TextField::Manufacturer),
        "year" => Some(TextField::Year),
        "category" => Some(TextField::Category),
        _ => None,
    }
}

fn store_text(
    field: TextField,
    value: String,
    header: &mut DatHeader,
    entry: Option<&mut CatalogEntry>,
) {
    match field {
        TextField::HeaderName => header.name = Some(value),
        TextField::HeaderDescription => header.description = Some(value),
        TextField::HeaderVersion => header.version = Some(value),
        TextField::HeaderAuthor => header.author = Some(value),
        TextField::HeaderDate => header.date = Some(value),
        TextField::HeaderHomepage => header.homepage = Some(value),
        entry_field => {
            let Some(entry) = entry else { return };
            match entry_field {
                TextField::Description => entry.description = Some(value),
                TextField::Manufacturer => entry.manufacturer = Some(value),
                TextField::Year => entry.year = Some(value),
                TextField::Category => entry.category = Some(value),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<datafile>
  <header>
    <name>Arcade</name>
    <description>Arcade &amp; friends</description>
    <version>0.261</version>
  </header>
  <game name="neogeo" isbios="yes">
    <description>Neo-Geo BIOS</description>
    <rom name="sp-s2.sp1" size="131072" crc="9036D879"/>
  </game>
  <game name="mslug" romof="neogeo" sourcefile="neogeo.cpp">
    <description>Metal Slug</description>
    <manufacturer>Nazca</manufacturer>
    <year>1996</year>
    <category>Shooter</category>
    <rom name="201-p1.p1" size="2097152" crc="08d8daa5" sha1="5A4B3E1A4C2E2C9B8F1D7A4A0E3C0F9B1A2D3E4F"/>
    <rom name="sp-s2.sp1" merge="sp-s2.sp1" size="131072" crc="9036d879"/>
    <rom name="bad.bin" size="10" status="nodump"/>
    <disk name="ignored" sha1="0000000000000000000000000000000000000000"/>
  </game>
  <machine name="mslugb" cloneof="mslug" romof="mslug">
    <rom name="b.p1" size="4" crc="1" subpath="alt"/>
  </machine>
  <game name="lonely"/>
</datafile>"#;

    #[test]
    fn parses_header_entries_and_relations() {
        let catalog = parse_catalog(SAMPLE).unwrap();
        assert_eq!(catalog.header.name.as_deref(), Some("Arcade"));
        assert_eq!(
            catalog.header.description.as_deref(),
            Some("Arcade & friends")
        );
        assert_eq!(catalog.len(), 4);

        let bios = catalog.get("neogeo").unwrap();
        assert!(bios.is_bios);
        assert!(bios.bios.is_none());

        let mslug = catalog.get("mslug").unwrap();
        assert_eq!(mslug.bios_requirement.as_deref(), Some("neogeo"));
        assert_eq!(mslug.bios.as_ref().unwrap().name, "neogeo");
        assert_eq!(mslug.manufacturer.as_deref(), Some("Nazca"));
        assert_eq!(mslug.year.as_deref(), Some("1996"));
        assert_eq!(mslug.category.as_deref(), Some("Shooter"));
        assert_eq!(mslug.source_file.as_deref(), Some("neogeo.cpp"));
        assert_eq!(mslug.files.len(), 3);
        let p1 = mslug.files.get("201-p1.p1", None).unwrap();
        assert_eq!(
            p1.sha1.as_deref(),
            Some("5a4b3e1a4c2e2c9b8f1d7a4a0e3c0f9b1a2d3e4f")
        );
        assert!(mslug.files.get("bad.bin", None).unwrap().nodump);

        let clone = catalog.get("mslugb").unwrap();
        assert_eq!(clone.parent_name.as_deref(), Some("mslug"));
        assert!(clone.bios_requirement.is_none());
        let b = clone.files.get("b.p1", Some("alt")).unwrap();
        assert_eq!(b.crc32, "00000001");

        assert!(catalog.get("lonely").unwrap().files.is_empty());
    }

    #[test]
    fn dangling_parent_is_not_a_parse_error() {
        let xml = r#"<datafile><game name="c" cloneof="missing"><rom name="a" size="1" crc="0"/></game></datafile>"#;
        let catalog = parse_catalog(xml).unwrap();
        assert_eq!(catalog.get("c").unwrap().parent_name.as_deref(), Some("missing"));
    }

    #[test]
    fn explicit_bios_attribute_wins() {
        let xml = r#"<datafile><game name="g" romof="p" cloneof="p" bios="pgm"/></datafile>"#;
        let catalog = parse_catalog(xml).unwrap();
        assert_eq!(catalog.get("g").unwrap().bios_requirement.as_deref(), Some("pgm"));
    }

    fn format_error(xml: &str) -> (String, String) {
        match parse_catalog(xml).unwrap_err() {
            EngineError::CatalogFormat { element, message } => (element, message),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn malformed_documents_name_the_element() {
        let (element, _) = format_error(r#"<datafile><game><rom name="a" size="1" crc="0"/></game></datafile>"#);
        assert_eq!(element, "game");

        let (element, message) =
            format_error(r#"<datafile><game name="g"><rom name="a" size="x" crc="0"/></game></datafile>"#);
        assert_eq!(element, "rom");
        assert!(message.contains("in set g"));

        let (element, _) =
            format_error(r#"<datafile><game name="g"><rom name="a" size="1" crc="nothex"/></game></datafile>"#);
        assert_eq!(element, "rom");

        let (element, message) =
            format_error(r#"<datafile><game name="g"/><game name="g"/></datafile>"#);
        assert_eq!(element, "game");
        assert!(message.contains("duplicate"));

        let (element, _) = format_error(r#"<datafile><rom name="a" size="1" crc="0"/></datafile>"#);
        assert_eq!(element, "rom");
    }

    #[test]
    fn broken_xml_is_a_format_error() {
        let err = parse_catalog(r#"<datafile><game name="g"></machine></datafile>"#).unwrap_err();
        assert!(matches!(err, EngineError::CatalogFormat { .. }));
    }
}
