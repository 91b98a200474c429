//! ## File Type Names
//!
//! File types are carried as ProDOS type codes wherever a mapping exists.
//! The tables here are private; use the accessor functions.

/// Map file type codes to strings for display
const TYPE_MAP_DISP: [(u32,&str);52] = [
    (0x00, "NON"),
    (0x01, "BAD"),
    (0x02, "PCD"), // Pascal code
    (0x03, "PTX"), // Pascal text
    (0x04, "TXT"),
    (0x05, "PDA"), // Pascal data
    (0x06, "BIN"),
    (0x07, "FNT"), // SOS
    (0x08, "FOT"), // Photo
    (0x09, "BA3"), // SOS
    (0x0a, "DA3"), // SOS
    (0x0b, "WPF"), // SOS
    (0x0c, "SOS"),
    (0x0f, "DIR"),
    (0x10, "RPD"), // SOS
    (0x11, "RPI"), // SOS
    (0x19, "ADB"), // AppleWorks Data Base
    (0x1a, "AWP"), // AppleWorks Word Processor
    (0x1b, "ASP"), // AppleWorks Spreadsheet
    (0x20, "TDM"),
    (0x2a, "8SC"),
    (0x2b, "8OB"),
    (0x2c, "8IC"),
    (0x42, "FTD"),
    (0x50, "GWP"),
    (0x51, "GSS"),
    (0x52, "GDB"),
    (0x53, "DRW"),
    (0x54, "GDP"),
    (0x55, "HMD"),
    (0x5a, "CFG"),
    (0xab, "GSB"),
    (0xac, "TDF"),
    (0xb0, "SRC"),
    (0xb3, "S16"),
    (0xc0, "PNT"),
    (0xc1, "PIC"),
    (0xc8, "FON"),
    (0xe0, "LBR"),
    (0xef, "PAS"), // Pascal area
    (0xf0, "CMD"),
    (0xf1, "$F1"),
    (0xf2, "$F2"),
    (0xf3, "$F3"),
    (0xf4, "$F4"),
    (0xf5, "$F5"),
    (0xfa, "INT"),
    (0xfb, "IVR"),
    (0xfc, "BAS"),
    (0xfd, "VAR"),
    (0xfe, "REL"),
    (0xff, "SYS")
];

/// (type, aux low, aux high, description).  Aux ranges are inclusive.
const TYPE_DESCRIPTIONS: [(u32,u32,u32,&str);48] = [
    (0x00, 0x0000, 0xffff, "Unknown"),
    (0x01, 0x0000, 0xffff, "Bad blocks"),
    (0x02, 0x0000, 0xffff, "Pascal code"),
    (0x03, 0x0000, 0xffff, "Pascal text"),
    (0x04, 0x0000, 0xffff, "ASCII text"),
    (0x05, 0x0000, 0xffff, "Pascal data"),
    (0x06, 0x0000, 0xffff, "Binary"),
    (0x08, 0x4000, 0x4000, "Packed hi-res picture"),
    (0x08, 0x4001, 0x4001, "Packed double hi-res picture"),
    (0x08, 0x0000, 0x3fff, "Apple II graphics"),
    (0x0f, 0x0000, 0xffff, "Folder"),
    (0x19, 0x0000, 0xffff, "AppleWorks data base"),
    (0x1a, 0x0000, 0xffff, "AppleWorks word processor"),
    (0x1b, 0x0000, 0xffff, "AppleWorks spreadsheet"),
    (0x20, 0x0000, 0xffff, "Desktop Manager document"),
    (0x2a, 0x0000, 0xffff, "Apple II source code"),
    (0x2b, 0x8001, 0x8001, "GEOS file"),
    (0x2c, 0x8003, 0x8003, "Apple II Pascal interpreter"),
    (0x42, 0x0000, 0xffff, "File type names"),
    (0x50, 0x8010, 0x8010, "AppleWorks GS word processor"),
    (0x50, 0x5445, 0x5445, "Teach document"),
    (0x50, 0x0000, 0xffff, "Word processor"),
    (0x51, 0x8010, 0x8010, "AppleWorks GS spreadsheet"),
    (0x52, 0x8010, 0x8010, "AppleWorks GS data base"),
    (0x53, 0x8010, 0x8010, "AppleWorks GS graphics"),
    (0x54, 0xdd3e, 0xdd3e, "Medley document"),
    (0x55, 0x0000, 0xffff, "Hypermedia"),
    (0x5a, 0x0000, 0xffff, "Configuration"),
    (0xab, 0x0000, 0xffff, "Apple IIgs BASIC program"),
    (0xac, 0x0000, 0xffff, "Apple IIgs BASIC TDF"),
    (0xb0, 0x0000, 0xffff, "Apple IIgs source code"),
    (0xb3, 0xdb07, 0xdb07, "GSHK document"),
    (0xb3, 0x0000, 0xffff, "GS/OS application"),
    (0xc0, 0x0001, 0x0001, "Packed super hi-res picture"),
    (0xc0, 0x0002, 0x0002, "Apple Preferred Format picture"),
    (0xc1, 0x0000, 0x0000, "Super hi-res screen image"),
    (0xc8, 0x0000, 0xffff, "Font"),
    (0xe0, 0x0005, 0x0005, "DiskCopy disk image"),
    (0xe0, 0x8002, 0x8002, "ShrinkIt (NuFX) document"),
    (0xe0, 0x8000, 0x8000, "Binary II"),
    (0xef, 0x0000, 0xffff, "Pascal area"),
    (0xf0, 0x0000, 0xffff, "ProDOS command file"),
    (0xfa, 0x0000, 0xffff, "Integer BASIC program"),
    (0xfb, 0x0000, 0xffff, "Integer BASIC variables"),
    (0xfc, 0x0000, 0xffff, "Applesoft BASIC program"),
    (0xfd, 0x0000, 0xffff, "Applesoft BASIC variables"),
    (0xfe, 0x0000, 0xffff, "Relocatable code"),
    (0xff, 0x0000, 0xffff, "ProDOS 8 application")
];

/// Three letter name for a ProDOS type code, `???` for codes with no name
pub fn type_name(file_type: u32) -> &'static str {
    match TYPE_MAP_DISP.iter().find(|(t,_)| *t==file_type) {
        Some((_,s)) => s,
        None => "???"
    }
}

/// Describe a type and aux type.  The first match in table order wins, so specific
/// aux types are listed ahead of catch-all ranges.  Unmatched aux types give `None`.
pub fn type_description(file_type: u32,aux_type: u32) -> Option<&'static str> {
    TYPE_DESCRIPTIONS.iter()
        .find(|(t,lo,hi,_)| *t==file_type && aux_type >= *lo && aux_type <= *hi)
        .map(|(_,_,_,s)| *s)
}

/// Look up a type code by its three letter name
pub fn type_from_name(name: &str) -> Option<u32> {
    let up = name.to_uppercase();
    TYPE_MAP_DISP.iter().find(|(_,s)| *s==up).map(|(t,_)| *t)
}

#[test]
fn names_and_descriptions() {
    assert_eq!(type_name(0xfc),"BAS");
    assert_eq!(type_name(0x77),"???");
    assert_eq!(type_from_name("sys"),Some(0xff));
    assert_eq!(type_description(0xc0,0x0002),Some("Apple Preferred Format picture"));
    assert_eq!(type_description(0xc0,0x1234),None);
    assert_eq!(type_description(0x50,0x8010),Some("AppleWorks GS word processor"));
    assert_eq!(type_description(0x50,0x0001),Some("Word processor"));
}
