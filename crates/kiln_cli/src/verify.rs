//! `kiln verify`: check a cached kernel without loading it.

use kiln_cache::{
    CachePaths, CacheReader, DependencyHasher, DependencyRecord, ResourceKind, SourceInput,
};
use kiln_config::resolve_toggles_from_env;
use kiln_diagnostics::{
    DiagnosticRenderer, DiagnosticSink, JsonRenderer, Severity, TerminalRenderer,
};
use kiln_mem::{SlotAllocator, SlotLayout};

use crate::{GlobalArgs, ReportFormat, VerifyArgs};

/// Runs the `kiln verify` command.
///
/// Validates the metadata header and dependency table of `<cache-dir>/<name>.info`
/// against the configured runtime libraries and the given sources. Returns
/// exit code 0 if the cached kernel would be reused, 1 otherwise. With
/// `--quiet`, informational misses are not printed.
pub fn run(args: &VerifyArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = crate::project::load(global)?;
    let toggles = resolve_toggles_from_env(&config.cache)?;
    let layout = SlotLayout::from_config(&config.memory)?;
    let slots = SlotAllocator::new(layout);

    let mut deps = DependencyHasher::runtime_dependencies(&config.cache.runtime);
    for path in &args.sources {
        let source = SourceInput::from_file(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        deps.push(DependencyRecord::new(
            source.name.clone(),
            ResourceKind::Source,
            source.digest(),
        ));
    }

    let dir = args.cache_dir.as_ref().unwrap_or(&config.cache.dir);
    let paths = CachePaths::new(dir, &args.name);
    let sink = DiagnosticSink::new();
    let result = CacheReader::new(&slots, &deps)
        .with_precision(toggles.float_precision)
        .with_sink(&sink)
        .check(&paths);

    let threshold = if global.quiet {
        Severity::Warning
    } else {
        Severity::Info
    };
    let diagnostics = sink.take_at_least(threshold);
    match args.format {
        ReportFormat::Text => {
            let renderer = TerminalRenderer::new(global.color);
            for diag in &diagnostics {
                eprintln!("{}", renderer.render(diag));
            }
        }
        ReportFormat::Json => {
            for diag in &diagnostics {
                println!("{}", JsonRenderer.render(diag));
            }
        }
    }

    match result {
        Ok(info) => {
            if !global.quiet && args.format == ReportFormat::Text {
                eprintln!(
                    "    Verified {} ({} dependencies, {} functions)",
                    args.name,
                    info.metadata.dependencies.len(),
                    info.metadata.functions.len()
                );
            }
            Ok(0)
        }
        Err(_) => Ok(1),
    }
}
