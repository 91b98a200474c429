//! # BIOS module
//!
//! Glue between file systems and images that is neither one nor the other.
//! The name comes from CP/M, where the BIOS sits below the BDOS and maps
//! logical records onto the physical disk.
//!
//! * `skew` holds sector interleave tables and 3.5 inch zone geometry
//! * `bpb` parses the BIOS parameter block of a FAT boot sector
//! * `fat` walks the allocation table of a FAT volume

pub mod skew;
pub mod bpb;
pub mod fat;
