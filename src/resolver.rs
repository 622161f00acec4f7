//! Symbol resolution from compiler output.
//!
//! Walks a `CodeGeneratorRequest`, resolves each node's display name to an
//! on-disk file, translates byte offsets into line/column positions, and
//! produces fresh index maps. Nothing is written into the live indices until
//! the whole walk succeeds; the caller applies the result afterwards, so a
//! failed resolve leaves the previous indices untouched.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use capnp::schema_capnp::{code_generator_request, node};
use thiserror::Error;

use crate::types::{Location, Position, Range, SymbolIndices};

/// Synthetic RPC argument/result structs; their spans collide with their
/// parent methods and are never definition targets.
const SYNTHETIC_SUFFIXES: [&str; 2] = ["$Params", "$Results"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("file not found for display name {display_name:?}")]
    FileNotFound { display_name: String },
    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed compiler output: {0}")]
    MalformedIr(#[from] capnp::Error),
    #[error("unknown node kind in compiler output: {0}")]
    UnknownNodeKind(#[from] capnp::NotInSchema),
    #[error("non-UTF-8 text in compiler output: {0}")]
    InvalidText(#[from] std::str::Utf8Error),
}

/// Index maps produced by one successful resolve.
#[derive(Debug, Default)]
pub struct ResolvedSymbols {
    /// Per requested file: every identifier occurrence. Presence of a key
    /// means that file was recompiled and its old entries must be dropped.
    pub file_ranges: HashMap<String, HashMap<Range, u64>>,
    /// Declaration sites, including nodes from imported files.
    pub node_locations: HashMap<u64, Location>,
}

impl ResolvedSymbols {
    /// Merge into the live indices: requested files are replaced wholesale,
    /// declaration locations are upserted.
    pub fn apply(self, indices: &mut SymbolIndices) {
        for (file, ranges) in self.file_ranges {
            indices.file_source_info.insert(file, ranges);
        }
        indices.node_locations.extend(self.node_locations);
    }
}

/// A display name resolved against the filesystem.
#[derive(Debug, Clone)]
struct ResolvedFile {
    /// Where the file actually lives, for reading.
    disk_path: PathBuf,
    /// Index key: workspace-relative when under the workspace, otherwise the
    /// on-disk path as-is.
    relative: String,
}

/// Resolve symbols from a parsed `CodeGeneratorRequest`.
pub fn resolve(
    request: code_generator_request::Reader<'_>,
    import_paths: &[String],
    workspace: &Path,
) -> Result<ResolvedSymbols, ResolveError> {
    let mut file_source_info = HashMap::new();
    for requested in request.get_requested_files()?.iter() {
        file_source_info.insert(requested.get_id(), requested.get_file_source_info()?);
    }

    let mut source_info = HashMap::new();
    for info in request.get_source_info()?.iter() {
        source_info.insert(info.get_id(), info);
    }

    let mut paths = PathResolver::new(import_paths, workspace);
    let mut files = FileCache::default();
    let mut resolved = ResolvedSymbols::default();

    for n in request.get_nodes()?.iter() {
        let display_name = n.get_display_name()?.to_str()?;

        if matches!(n.which()?, node::Which::File(())) {
            // Identifier occurrences exist only for requested files; imported
            // file nodes contribute nothing here.
            let Some(info) = file_source_info.get(&n.get_id()) else {
                continue;
            };
            let file = paths.lookup(display_name)?;

            // A fresh (possibly empty) map; applying it drops stale entries
            // from the previous compile of this file.
            let ranges = resolved.file_ranges.entry(file.relative.clone()).or_default();

            resolved.node_locations.insert(
                n.get_id(),
                Location {
                    uri: file.relative.clone(),
                    range: Range::new(Position::new(1, 1), Position::new(1, 1)),
                },
            );

            for identifier in info.get_identifiers()?.iter() {
                let range = Range::new(
                    files.position_at(&file.disk_path, identifier.get_start_byte())?,
                    files.position_at(&file.disk_path, identifier.get_end_byte())?,
                );
                ranges.insert(range, identifier.get_type_id());
            }
            continue;
        }

        if SYNTHETIC_SUFFIXES
            .iter()
            .any(|suffix| display_name.ends_with(suffix))
        {
            continue;
        }

        let file = paths.lookup(display_name)?;
        if let Some(info) = source_info.get(&n.get_id()) {
            let range = Range::new(
                files.position_at(&file.disk_path, info.get_start_byte())?,
                files.position_at(&file.disk_path, info.get_end_byte())?,
            );
            resolved.node_locations.insert(
                n.get_id(),
                Location {
                    uri: file.relative,
                    range,
                },
            );
        }
    }

    Ok(resolved)
}

/// Resolves display names to files, caching results per display-name prefix.
struct PathResolver<'a> {
    import_paths: &'a [String],
    workspace: &'a Path,
    cache: HashMap<String, ResolvedFile>,
}

impl<'a> PathResolver<'a> {
    fn new(import_paths: &'a [String], workspace: &'a Path) -> Self {
        Self {
            import_paths,
            workspace,
            cache: HashMap::new(),
        }
    }

    /// Resolve a display name of the form `<path>[:<qualified-name>]`.
    ///
    /// The path prefix is searched first in the workspace, then under each
    /// import path in declared order; the first hit wins. A miss is a hard
    /// resolver error.
    fn lookup(&mut self, display_name: &str) -> Result<ResolvedFile, ResolveError> {
        let prefix = display_name
            .split_once(':')
            .map_or(display_name, |(path, _)| path);
        let relative_name = prefix.strip_prefix('/').unwrap_or(prefix);

        if let Some(found) = self.cache.get(relative_name) {
            return Ok(found.clone());
        }

        let found = self.search(relative_name).ok_or_else(|| {
            ResolveError::FileNotFound {
                display_name: display_name.to_string(),
            }
        })?;
        self.cache
            .insert(relative_name.to_string(), found.clone());
        Ok(found)
    }

    fn search(&self, relative_name: &str) -> Option<ResolvedFile> {
        let in_workspace = self.workspace.join(relative_name);
        if in_workspace.is_file() {
            return Some(self.resolved(in_workspace));
        }

        for import_path in self.import_paths {
            let base = Path::new(import_path);
            let candidate = if base.is_absolute() {
                base.join(relative_name)
            } else {
                self.workspace.join(base).join(relative_name)
            };
            if candidate.is_file() {
                return Some(self.resolved(candidate));
            }
        }

        None
    }

    fn resolved(&self, disk_path: PathBuf) -> ResolvedFile {
        let relative = disk_path
            .strip_prefix(self.workspace)
            .map_or_else(
                |_| disk_path.to_string_lossy().into_owned(),
                |p| p.to_string_lossy().into_owned(),
            );
        ResolvedFile {
            disk_path,
            relative,
        }
    }
}

/// Reads files once per resolve and translates byte offsets to positions.
#[derive(Default)]
struct FileCache {
    contents: HashMap<PathBuf, Vec<u8>>,
}

impl FileCache {
    /// Translate `byte_offset` into a 1-based position by scanning from the
    /// start of the file. `\n` advances the line and resets the character;
    /// offset 0 is (1, 1).
    fn position_at(&mut self, path: &Path, byte_offset: u32) -> Result<Position, ResolveError> {
        let content = match self.contents.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let bytes = std::fs::read(path).map_err(|source| ResolveError::FileRead {
                    path: path.to_path_buf(),
                    source,
                })?;
                entry.insert(bytes)
            }
        };

        let mut position = Position::new(1, 1);
        for &byte in content.iter().take(byte_offset as usize) {
            if byte == b'\n' {
                position.line += 1;
                position.character = 1;
            } else {
                position.character += 1;
            }
        }
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capnp::schema_capnp::code_generator_request;

    const SCHEMA: &str = "\
@0xbf5147cbbecf40c1;

struct Foo {
  bar @0 :Bar;
}

struct Bar {
  x @0 :UInt32;
}
";

    const FILE_ID: u64 = 0xa000_0000_0000_0001;
    const FOO_ID: u64 = 0xa000_0000_0000_0002;
    const BAR_ID: u64 = 0xa000_0000_0000_0003;

    struct NodeSpec {
        id: u64,
        display_name: String,
        is_file: bool,
        span: Option<(u32, u32)>,
    }

    struct IdentifierSpec {
        start: u32,
        end: u32,
        type_id: u64,
    }

    /// Build a CodeGeneratorRequest the way the compiler would emit it.
    fn build_request(
        nodes: &[NodeSpec],
        requested: &[(u64, Vec<IdentifierSpec>)],
    ) -> capnp::message::Builder<capnp::message::HeapAllocator> {
        let mut builder = capnp::message::Builder::new_default();
        {
            let mut request = builder.init_root::<code_generator_request::Builder>();

            {
                let mut node_list = request.reborrow().init_nodes(nodes.len() as u32);
                for (i, spec) in nodes.iter().enumerate() {
                    let mut n = node_list.reborrow().get(i as u32);
                    n.set_id(spec.id);
                    n.set_display_name(&spec.display_name[..]);
                    if spec.is_file {
                        n.set_file(());
                    } else {
                        n.init_struct();
                    }
                }
            }

            {
                let with_spans: Vec<_> =
                    nodes.iter().filter(|spec| spec.span.is_some()).collect();
                let mut info_list = request
                    .reborrow()
                    .init_source_info(with_spans.len() as u32);
                for (i, spec) in with_spans.iter().enumerate() {
                    let mut info = info_list.reborrow().get(i as u32);
                    info.set_id(spec.id);
                    let (start, end) = spec.span.expect("filtered on span");
                    info.set_start_byte(start);
                    info.set_end_byte(end);
                }
            }

            {
                let mut file_list = request
                    .reborrow()
                    .init_requested_files(requested.len() as u32);
                for (i, (file_id, identifiers)) in requested.iter().enumerate() {
                    let mut requested_file = file_list.reborrow().get(i as u32);
                    requested_file.set_id(*file_id);
                    let mut identifier_list = requested_file
                        .init_file_source_info()
                        .init_identifiers(identifiers.len() as u32);
                    for (j, ident) in identifiers.iter().enumerate() {
                        let mut entry = identifier_list.reborrow().get(j as u32);
                        entry.set_start_byte(ident.start);
                        entry.set_end_byte(ident.end);
                        entry.set_type_id(ident.type_id);
                    }
                }
            }
        }
        builder
    }

    fn workspace_with_schema() -> (tempfile::TempDir, usize, usize) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.capnp"), SCHEMA).unwrap();
        // The occurrence of "Bar" in the field, not the declaration.
        let occurrence = SCHEMA.find(":Bar").unwrap() + 1;
        let declaration = SCHEMA.find("struct Bar").unwrap();
        (dir, occurrence, declaration)
    }

    fn default_nodes(occurrence_decl: (usize, usize)) -> Vec<NodeSpec> {
        let (_, declaration) = occurrence_decl;
        vec![
            NodeSpec {
                id: FILE_ID,
                display_name: "a.capnp".to_string(),
                is_file: true,
                span: None,
            },
            NodeSpec {
                id: FOO_ID,
                display_name: "a.capnp:Foo".to_string(),
                is_file: false,
                span: Some((
                    SCHEMA.find("struct Foo").unwrap() as u32,
                    (SCHEMA.find("struct Foo").unwrap() + 10) as u32,
                )),
            },
            NodeSpec {
                id: BAR_ID,
                display_name: "a.capnp:Bar".to_string(),
                is_file: false,
                span: Some((declaration as u32, (declaration + 10) as u32)),
            },
        ]
    }

    #[test]
    fn resolves_identifiers_and_declarations() {
        let (dir, occurrence, declaration) = workspace_with_schema();
        let builder = build_request(
            &default_nodes((occurrence, declaration)),
            &[(
                FILE_ID,
                vec![IdentifierSpec {
                    start: occurrence as u32,
                    end: (occurrence + 3) as u32,
                    type_id: BAR_ID,
                }],
            )],
        );
        let request = builder
            .get_root_as_reader::<code_generator_request::Reader>()
            .unwrap();

        let resolved = resolve(request, &[], dir.path()).unwrap();

        let ranges = &resolved.file_ranges["a.capnp"];
        assert_eq!(ranges.len(), 1);
        let (range, type_id) = ranges.iter().next().unwrap();
        assert_eq!(*type_id, BAR_ID);
        // "bar @0 :Bar;" is on line 4 of the schema.
        assert_eq!(range.start.line, 4);

        let file_location = &resolved.node_locations[&FILE_ID];
        assert_eq!(file_location.uri, "a.capnp");
        assert_eq!(
            file_location.range,
            Range::new(Position::new(1, 1), Position::new(1, 1))
        );

        let bar_location = &resolved.node_locations[&BAR_ID];
        assert_eq!(bar_location.uri, "a.capnp");
        // "struct Bar" is on line 7.
        assert_eq!(bar_location.range.start.line, 7);
    }

    #[test]
    fn synthetic_rpc_structs_are_skipped() {
        let (dir, occurrence, declaration) = workspace_with_schema();
        let mut nodes = default_nodes((occurrence, declaration));
        nodes.push(NodeSpec {
            id: 0xbad0,
            display_name: "a.capnp:Iface.method$Params".to_string(),
            is_file: false,
            span: Some((0, 4)),
        });
        nodes.push(NodeSpec {
            id: 0xbad1,
            display_name: "a.capnp:Iface.method$Results".to_string(),
            is_file: false,
            span: Some((0, 4)),
        });
        let builder = build_request(&nodes, &[(FILE_ID, vec![])]);
        let request = builder
            .get_root_as_reader::<code_generator_request::Reader>()
            .unwrap();

        let resolved = resolve(request, &[], dir.path()).unwrap();

        assert!(!resolved.node_locations.contains_key(&0xbad0));
        assert!(!resolved.node_locations.contains_key(&0xbad1));
        assert!(resolved.node_locations.contains_key(&FOO_ID));
    }

    #[test]
    fn nodes_without_source_info_get_no_location() {
        let (dir, occurrence, declaration) = workspace_with_schema();
        let mut nodes = default_nodes((occurrence, declaration));
        nodes[1].span = None; // Foo loses its span
        let builder = build_request(&nodes, &[(FILE_ID, vec![])]);
        let request = builder
            .get_root_as_reader::<code_generator_request::Reader>()
            .unwrap();

        let resolved = resolve(request, &[], dir.path()).unwrap();
        assert!(!resolved.node_locations.contains_key(&FOO_ID));
        assert!(resolved.node_locations.contains_key(&BAR_ID));
    }

    #[test]
    fn unresolvable_display_name_aborts_resolve() {
        let (dir, occurrence, declaration) = workspace_with_schema();
        let mut nodes = default_nodes((occurrence, declaration));
        nodes[2].display_name = "missing.capnp:Bar".to_string();
        let builder = build_request(&nodes, &[(FILE_ID, vec![])]);
        let request = builder
            .get_root_as_reader::<code_generator_request::Reader>()
            .unwrap();

        let err = resolve(request, &[], dir.path()).unwrap_err();
        assert!(matches!(err, ResolveError::FileNotFound { .. }));
    }

    #[test]
    fn apply_replaces_requested_file_entries_and_upserts_locations() {
        let mut indices = SymbolIndices::default();

        let stale_range = Range::new(Position::new(9, 9), Position::new(9, 12));
        let mut stale = HashMap::new();
        stale.insert(stale_range, 0xdead_u64);
        indices
            .file_source_info
            .insert("a.capnp".to_string(), stale);
        indices.node_locations.insert(
            0xdead,
            Location {
                uri: "a.capnp".to_string(),
                range: stale_range,
            },
        );

        let mut fresh = ResolvedSymbols::default();
        let fresh_range = Range::new(Position::new(2, 1), Position::new(2, 4));
        let mut ranges = HashMap::new();
        ranges.insert(fresh_range, BAR_ID);
        fresh.file_ranges.insert("a.capnp".to_string(), ranges);
        fresh.node_locations.insert(
            BAR_ID,
            Location {
                uri: "a.capnp".to_string(),
                range: fresh_range,
            },
        );
        fresh.apply(&mut indices);

        // Old identifier entries for the recompiled file are gone.
        let ranges = &indices.file_source_info["a.capnp"];
        assert_eq!(ranges.len(), 1);
        assert!(ranges.contains_key(&fresh_range));
        // Locations are upserted, never cleared.
        assert!(indices.node_locations.contains_key(&0xdead));
        assert!(indices.node_locations.contains_key(&BAR_ID));
    }

    #[test]
    fn file_with_no_identifiers_still_resets_its_entry() {
        let (dir, occurrence, declaration) = workspace_with_schema();
        let builder = build_request(
            &default_nodes((occurrence, declaration)),
            &[(FILE_ID, vec![])],
        );
        let request = builder
            .get_root_as_reader::<code_generator_request::Reader>()
            .unwrap();

        let resolved = resolve(request, &[], dir.path()).unwrap();
        assert!(resolved.file_ranges["a.capnp"].is_empty());

        // Applying the empty map clears stale entries.
        let mut indices = SymbolIndices::default();
        let mut stale = HashMap::new();
        stale.insert(
            Range::new(Position::new(1, 1), Position::new(1, 2)),
            7_u64,
        );
        indices
            .file_source_info
            .insert("a.capnp".to_string(), stale);
        resolved.apply(&mut indices);
        assert!(indices.file_source_info["a.capnp"].is_empty());
    }

    #[test]
    fn import_path_search_order() {
        let workspace = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();

        // Same file name in a relative import dir and an absolute one; the
        // relative dir is declared first and must win.
        std::fs::create_dir(workspace.path().join("imports")).unwrap();
        std::fs::write(workspace.path().join("imports/b.capnp"), "x").unwrap();
        std::fs::write(outside.path().join("b.capnp"), "x").unwrap();

        let import_paths = vec![
            "imports".to_string(),
            outside.path().to_str().unwrap().to_string(),
        ];
        let mut resolver = PathResolver::new(&import_paths, workspace.path());

        let found = resolver.lookup("b.capnp:Baz").unwrap();
        assert_eq!(found.relative, "imports/b.capnp");
        assert_eq!(found.disk_path, workspace.path().join("imports/b.capnp"));
    }

    #[test]
    fn absolute_import_path_yields_disk_path_key() {
        let workspace = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("c.capnp"), "x").unwrap();

        let import_paths = vec![outside.path().to_str().unwrap().to_string()];
        let mut resolver = PathResolver::new(&import_paths, workspace.path());

        let found = resolver.lookup("c.capnp").unwrap();
        // Not under the workspace: keyed by its on-disk path.
        let expected = outside.path().join("c.capnp");
        assert_eq!(found.relative, expected.to_string_lossy().as_ref());
    }

    #[test]
    fn leading_slash_is_stripped_before_search() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("d.capnp"), "x").unwrap();

        let mut resolver = PathResolver::new(&[], workspace.path());
        let found = resolver.lookup("/d.capnp:Thing").unwrap();
        assert_eq!(found.relative, "d.capnp");
    }

    #[test]
    fn workspace_hit_wins_over_imports() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir(workspace.path().join("imports")).unwrap();
        std::fs::write(workspace.path().join("e.capnp"), "ws").unwrap();
        std::fs::write(workspace.path().join("imports/e.capnp"), "import").unwrap();

        let import_paths = vec!["imports".to_string()];
        let mut resolver = PathResolver::new(&import_paths, workspace.path());
        let found = resolver.lookup("e.capnp").unwrap();
        assert_eq!(found.relative, "e.capnp");
    }

    #[test]
    fn byte_to_position_translation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.capnp");
        std::fs::write(&path, "ab\ncd\n").unwrap();

        let mut cache = FileCache::default();
        assert_eq!(cache.position_at(&path, 0).unwrap(), Position::new(1, 1));
        assert_eq!(cache.position_at(&path, 1).unwrap(), Position::new(1, 2));
        // Offset 2 is the newline itself; scanning stops before it.
        assert_eq!(cache.position_at(&path, 2).unwrap(), Position::new(1, 3));
        assert_eq!(cache.position_at(&path, 3).unwrap(), Position::new(2, 1));
        assert_eq!(cache.position_at(&path, 5).unwrap(), Position::new(2, 3));
    }

    #[test]
    fn byte_to_position_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.capnp");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let mut cache = FileCache::default();
        let first = cache.position_at(&path, 12).unwrap();
        let second = cache.position_at(&path, 12).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Position::new(2, 4));
    }
}
