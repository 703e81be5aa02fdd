//! `kiln inspect`: dump a metadata file.

use std::fmt::Write;

use kiln_cache::format::FLAG_THREADABLE;
use kiln_cache::reader::InfoFile;

use crate::{GlobalArgs, InspectArgs, ReportFormat};

/// Runs the `kiln inspect` command.
///
/// Returns exit code 0 if the file decodes, 1 if it is rejected.
pub fn run(args: &InspectArgs, _global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(&args.info)?;
    let info = match InfoFile::parse(&bytes) {
        Ok(info) => info,
        Err(reason) => {
            eprintln!("error: {} is not a valid cache file: {reason}", args.info.display());
            return Ok(1);
        }
    };

    match args.format {
        ReportFormat::Text => print!("{}", render_text(&info)),
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
    }
    Ok(0)
}

/// Formats a decoded metadata file for the terminal.
pub fn render_text(info: &InfoFile) -> String {
    let header = &info.header;
    let meta = &info.metadata;
    let mut out = String::new();

    let _ = writeln!(out, "address      {:#x}", header.artifact_address);
    let _ = writeln!(out, "size         {}", header.artifact_size);
    let _ = writeln!(out, "checksum     {:#010x}", header.checksum);
    let _ = writeln!(
        out,
        "flags        threadable={} debug_info={}",
        header.flags & FLAG_THREADABLE != 0,
        meta.debug_info
    );
    let _ = writeln!(out, "precision    {}", meta.float_precision());

    let _ = writeln!(out, "dependencies ({})", meta.dependencies.len());
    for dep in &meta.dependencies {
        let _ = writeln!(out, "  {}  {:<7}  {}", dep.digest, dep.kind, dep.name);
    }
    let _ = writeln!(out, "pragmas ({})", meta.pragmas.len());
    for pragma in &meta.pragmas {
        let _ = writeln!(out, "  {} = {:?}", pragma.key, pragma.value);
    }
    let _ = writeln!(out, "object slots {:?}", meta.object_slots);
    let _ = writeln!(out, "export vars ({})", meta.export_vars.len());
    for var in &meta.export_vars {
        let _ = writeln!(out, "  {:#x}  {}", var.address, var.name);
    }
    let _ = writeln!(out, "export funcs {}", meta.export_funcs.join(", "));
    let _ = writeln!(out, "kernels ({})", meta.export_foreach.len());
    for export in &meta.export_foreach {
        let _ = writeln!(out, "  {} sig={:#x}", export.name, export.signature);
    }
    let _ = writeln!(out, "functions ({})", meta.functions.len());
    for function in &meta.functions {
        let _ = writeln!(
            out,
            "  {:#x}  {:>6}  {}",
            function.address, function.size, function.name
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cache::writer::encode_info;
    use kiln_cache::{
        ArtifactMetadata, DependencyHasher, DependencyRecord, ExportVar, FunctionRecord, Pragma,
        ResourceKind,
    };

    fn info() -> InfoFile {
        let meta = ArtifactMetadata {
            threadable: true,
            dependencies: vec![DependencyRecord::new(
                "blur.bc",
                ResourceKind::Source,
                DependencyHasher::hash(b"abc"),
            )],
            pragmas: vec![Pragma::new("fp_relaxed", "")],
            export_vars: vec![
                ExportVar::new("radius", 0x6000_0000_0400),
                ExportVar::new("gain", 0x6000_0000_0404),
            ],
            functions: vec![FunctionRecord {
                name: "root".into(),
                address: 0x6000_0000_0000,
                size: 128,
            }],
            ..ArtifactMetadata::default()
        };
        let bytes = encode_info(&meta, 0x6000_0000_0000, &[0u8; 4096]).unwrap();
        InfoFile::parse(&bytes).unwrap()
    }

    #[test]
    fn text_lists_every_section() {
        let text = render_text(&info());
        assert!(text.contains("address      0x600000000000"));
        assert!(text.contains("threadable=true debug_info=false"));
        assert!(text.contains("precision    relaxed"));
        assert!(text.contains("a9993e364706816aba3e25717850c26c9cd0d89d  source   blur.bc"));
        assert!(text.contains("export vars (2)\n  0x600000000400  radius\n  0x600000000404  gain\n"));
        assert!(text.contains("0x600000000000     128  root"));
    }

    #[test]
    fn json_is_valid() {
        let json = serde_json::to_value(info()).unwrap();
        assert_eq!(json["metadata"]["export_vars"][1]["name"], "gain");
        assert_eq!(json["metadata"]["export_vars"][1]["address"], 0x6000_0000_0404u64);
        assert_eq!(json["header"]["artifact_size"], 4096);
    }
}
