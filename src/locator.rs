//! # Cover/Image Locator Module
//!
//! Questo modulo individua le entry immagine da elaborare dentro l'archivio EPUB.
//!
//! ## Responsabilità:
//! - `find_opf()`: Trova il package document (`.opf`) nella lista delle entry
//! - `find_images()`: Trova tutte le entry jpg/jpeg/png (modalità all-images)
//! - `find_cover_image()`: Risolve il path della copertina con tre strategie
//! - `resolve_path()`: Unisce un href relativo alla cartella dell'OPF
//!
//! ## Strategie per la copertina (in ordine):
//! 1. **Metadata**: `<meta name="cover" content="...">`, il content è un nome
//!    file immagine oppure l'id di un item del manifest
//! 2. **Manifest id**: item del manifest con `id="cover-image"`
//! 3. **Cover page**: primo `<img src>` dentro l'entry `*cover.xhtml`
//!
//! Ogni strategia restituisce `Option<String>`: la prima che trova un path
//! presente nell'archivio vince, i fallimenti non vengono propagati.
//! Se tutte falliscono il risultato è `CoverNotFound`.

use lol_html::{element, rewrite_str, RewriteStrSettings};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use std::io::{Read, Seek};
use std::path::PathBuf;
use tracing::debug;
use zip::ZipArchive;

use crate::error::OptimizeError;

/// Namespace of the OPF package document
pub const OPF_NAMESPACE: &[u8] = b"http://www.idpf.org/2007/opf";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const COVER_PAGE_SUFFIX: &str = "cover.xhtml";
const COVER_IMAGE_ID: &str = "cover-image";

/// Read access to the members of an archive
pub trait EntrySource {
    /// Entry names in archive order
    fn entry_names(&mut self) -> Vec<String>;

    /// Full content of one entry, `None` when missing or unreadable
    fn read_entry(&mut self, name: &str) -> Option<Vec<u8>>;
}

impl<R: Read + Seek> EntrySource for ZipArchive<R> {
    fn entry_names(&mut self) -> Vec<String> {
        (0..self.len())
            .filter_map(|index| self.by_index_raw(index).ok().map(|f| f.name().to_string()))
            .collect()
    }

    fn read_entry(&mut self, name: &str) -> Option<Vec<u8>> {
        let mut file = self.by_name(name).ok()?;
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content).ok()?;
        Some(content)
    }
}

/// Returns the first entry ending in `.opf`
pub fn find_opf(entries: &[String]) -> Result<&str, OptimizeError> {
    entries
        .iter()
        .map(String::as_str)
        .find(|name| name.ends_with(".opf"))
        .ok_or(OptimizeError::OpfNotFound)
}

/// Folder containing the OPF, the base for every relative href inside it
pub fn opf_folder(opf_path: &str) -> &str {
    opf_path.rsplit_once('/').map(|(folder, _)| folder).unwrap_or("")
}

/// Every entry whose basename is an image file name, in archive order
pub fn find_images(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .filter(|name| is_image_name(name))
        .cloned()
        .collect()
}

/// True when the basename ends in `<word chars or hyphens>.jpg|.jpeg|.png`,
/// extension compared case-insensitively.
pub fn is_image_name(name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let Some((stem, extension)) = basename.rsplit_once('.') else {
        return false;
    };

    let known_extension = IMAGE_EXTENSIONS
        .iter()
        .any(|ext| extension.eq_ignore_ascii_case(ext));

    known_extension
        && stem
            .chars()
            .last()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Join `href` to `folder` and normalize to `/`-separated archive form.
///
/// `.` segments are dropped and `..` pops the previous segment.
pub fn resolve_path(folder: &str, href: &str) -> String {
    let href = href.split(['#', '?']).next().unwrap_or(href).replace('\\', "/");

    let mut segments: Vec<&str> = Vec::new();
    let base = if href.starts_with('/') { "" } else { folder };
    for segment in base.split('/').chain(href.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// What the cover strategies need from the OPF
#[derive(Debug, Default, PartialEq)]
pub struct PackageDocument {
    /// `content` of the first metadata child with `name="cover"`
    pub cover_content: Option<String>,
    /// Manifest children that carry an `id`, in document order
    pub manifest: Vec<ManifestItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    pub id: String,
    pub href: Option<String>,
}

impl PackageDocument {
    /// Parse the OPF. `None` on malformed XML.
    pub fn parse(opf: &[u8]) -> Option<Self> {
        #[derive(Clone, Copy, PartialEq)]
        enum Section {
            Metadata,
            Manifest,
        }

        let mut reader = NsReader::from_reader(opf);
        let mut buf = Vec::new();
        let mut document = PackageDocument::default();
        let mut depth = 0usize;
        let mut section: Option<Section> = None;
        let mut seen_metadata = false;
        let mut seen_manifest = false;

        loop {
            let (namespace, event) = match reader.read_resolved_event_into(&mut buf) {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!("Malformed package document: {}", e);
                    return None;
                }
            };
            let in_opf = matches!(namespace, ResolveResult::Bound(Namespace(ns)) if ns == OPF_NAMESPACE);

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    let element_depth = depth + 1;

                    // Direct children of the package root
                    if element_depth == 2 && in_opf && !is_empty {
                        match e.local_name().as_ref() {
                            b"metadata" if !seen_metadata => {
                                seen_metadata = true;
                                section = Some(Section::Metadata);
                            }
                            b"manifest" if !seen_manifest => {
                                seen_manifest = true;
                                section = Some(Section::Manifest);
                            }
                            _ => {}
                        }
                    } else if element_depth == 3 {
                        match section {
                            Some(Section::Metadata) => document.read_metadata_child(e),
                            Some(Section::Manifest) => document.read_manifest_child(e),
                            None => {}
                        }
                    }

                    if !is_empty {
                        depth += 1;
                    }
                }
                Event::End(_) => {
                    if depth == 2 {
                        section = None;
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Some(document)
    }

    fn read_metadata_child(&mut self, element: &BytesStart<'_>) {
        if self.cover_content.is_some() {
            return;
        }
        if attribute(element, "name").as_deref() == Some("cover") {
            self.cover_content = attribute(element, "content");
        }
    }

    fn read_manifest_child(&mut self, element: &BytesStart<'_>) {
        if let Some(id) = attribute(element, "id") {
            self.manifest.push(ManifestItem {
                id,
                href: attribute(element, "href"),
            });
        }
    }

    /// Href of the first manifest item with the given id
    pub fn manifest_href(&self, id: &str) -> Option<&str> {
        self.manifest
            .iter()
            .find(|item| item.id == id)
            .and_then(|item| item.href.as_deref())
    }
}

fn attribute(element: &BytesStart<'_>, key: &str) -> Option<String> {
    element
        .try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

/// State shared by the cover strategies during one lookup
pub struct CoverSearch<'a, S: EntrySource> {
    package: Option<PackageDocument>,
    opf_folder: &'a str,
    entries: Vec<String>,
    source: &'a mut S,
}

impl<'a, S: EntrySource> CoverSearch<'a, S> {
    pub fn new(opf: &[u8], opf_folder: &'a str, source: &'a mut S) -> Self {
        let entries = source.entry_names();
        Self {
            package: PackageDocument::parse(opf),
            opf_folder,
            entries,
            source,
        }
    }

    /// Resolve a candidate href and keep it only if the archive has it
    fn accept(&self, href: &str) -> Option<String> {
        let path = resolve_path(self.opf_folder, href);
        if self.entries.iter().any(|entry| *entry == path) {
            Some(path)
        } else {
            debug!("Cover candidate {} is not an archive entry", path);
            None
        }
    }
}

type CoverStrategy<S> = fn(&mut CoverSearch<'_, S>) -> Option<String>;

/// `<meta name="cover" content="...">`, directly or through the manifest
fn cover_from_metadata<S: EntrySource>(search: &mut CoverSearch<'_, S>) -> Option<String> {
    let package = search.package.as_ref()?;
    let content = package.cover_content.as_deref()?;

    if is_image_name(content) {
        return search.accept(content);
    }

    let href = package.manifest_href(content)?;
    if !is_image_name(href) {
        return None;
    }
    search.accept(href)
}

/// Manifest item with `id="cover-image"`
fn cover_from_manifest_id<S: EntrySource>(search: &mut CoverSearch<'_, S>) -> Option<String> {
    let href = search.package.as_ref()?.manifest_href(COVER_IMAGE_ID)?;
    if !is_image_name(href) {
        return None;
    }
    search.accept(href)
}

/// First `<img src>` of the `*cover.xhtml` entry
fn cover_from_cover_page<S: EntrySource>(search: &mut CoverSearch<'_, S>) -> Option<String> {
    let page = search
        .entries
        .iter()
        .find(|name| name.ends_with(COVER_PAGE_SUFFIX))?
        .clone();
    let content = search.source.read_entry(&page)?;
    let src = first_img_src(&String::from_utf8_lossy(&content))?;
    search.accept(&src)
}

/// `src` of the first `img` element in document order. Tolerates broken markup.
pub fn first_img_src(html: &str) -> Option<String> {
    let mut src: Option<String> = None;

    let result = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img[src]", |el| {
                if src.is_none() {
                    src = el.get_attribute("src");
                }
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    );

    if let Err(e) = result {
        debug!("Cover page could not be parsed: {}", e);
        return None;
    }
    src.filter(|value| !value.trim().is_empty())
}

/// Resolve the cover image path: metadata, then `cover-image` manifest id,
/// then the cover page.
pub fn find_cover_image<S: EntrySource>(
    opf: &[u8],
    opf_folder: &str,
    source: &mut S,
) -> Option<String> {
    let strategies: [(&str, CoverStrategy<S>); 3] = [
        ("metadata", cover_from_metadata::<S>),
        ("manifest id", cover_from_manifest_id::<S>),
        ("cover page", cover_from_cover_page::<S>),
    ];

    let mut search = CoverSearch::new(opf, opf_folder, source);
    for (name, strategy) in strategies {
        if let Some(path) = strategy(&mut search) {
            debug!("Cover image found by {} strategy: {}", name, path);
            return Some(path);
        }
        debug!("Cover {} strategy found nothing, falling through", name);
    }
    None
}

/// Locate the OPF and resolve the cover of an opened archive
pub fn locate_cover<S: EntrySource>(
    source: &mut S,
    entries: &[String],
    epub_path: &std::path::Path,
) -> Result<String, OptimizeError> {
    let cover_not_found = || OptimizeError::CoverNotFound {
        path: PathBuf::from(epub_path),
    };

    let opf_path = find_opf(entries).map_err(|e| {
        debug!("{}: {}", epub_path.display(), e);
        cover_not_found()
    })?;
    let opf = source.read_entry(opf_path).ok_or_else(cover_not_found)?;

    find_cover_image(&opf, opf_folder(opf_path), source).ok_or_else(cover_not_found)
}
