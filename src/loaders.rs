use anyhow::{bail, Context, Error};
use colored::*;
use path_clean::PathClean;
use sha::sha1::Sha1;
use sha::utils::{Digest, DigestExt};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

/// Coarse content tag attached to every loaded module, driving only the
/// decision of whether the source needs synthetic wrapping before it is
/// handed to V8 as an ES module body. A TypeScript compiler front-end is out
/// of scope, so `.ts`/`.tsx` sources load as-is and are expected to already
/// be valid JavaScript syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    JavaScript,
    Json,
    Wasm,
    Unknown,
}

impl MediaType {
    pub fn from_specifier(specifier: &str) -> MediaType {
        let path = specifier.split(['?', '#']).next().unwrap_or(specifier);
        match Path::new(path).extension().and_then(|ext| ext.to_str()) {
            Some("json") => MediaType::Json,
            Some("wasm") => MediaType::Wasm,
            Some("js" | "mjs" | "cjs" | "jsx" | "ts" | "tsx" | "mts" | "cts") => {
                MediaType::JavaScript
            }
            _ => MediaType::Unknown,
        }
    }
}

/// What a host must supply to let the module graph reach outside the
/// process: given a specifier (plus the referrer it appeared in), say what
/// canonical specifier it resolves to, then load that specifier's source.
/// `FsModuleLoader` and `UrlModuleLoader` are reference implementations; a
/// host embedding the runtime is free to register its own (virtual
/// filesystems, bundlers, in-memory fixtures for tests).
pub trait ModuleLoader {
    fn resolve(&self, base: Option<&str>, specifier: &str) -> Result<String, Error>;
    fn load(&self, specifier: &str) -> Result<(MediaType, String), Error>;
}

static EXTENSIONS: &[&str] = &["js", "mjs", "json"];

fn wrap_json(source: &str) -> String {
    format!("export default JSON.parse({});", serde_json::to_string(source).unwrap())
}

#[derive(Default)]
pub struct FsModuleLoader;

impl FsModuleLoader {
    fn clean(&self, path: PathBuf) -> Result<String, Error> {
        path.clean()
            .into_os_string()
            .into_string()
            .map_err(|_| Error::msg("module path is not valid UTF-8"))
    }

    // If import is a file, load it as-is.
    fn resolve_as_file(&self, path: &Path) -> Result<PathBuf, Error> {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        for ext in EXTENSIONS {
            let path = path.with_extension(ext);
            if path.is_file() {
                return Ok(path);
            }
        }
        bail!("Failed to find module \"{}\"", path.display());
    }

    // If import is a directory, load it using the 'index.[ext]' convention.
    fn resolve_as_directory(&self, path: &Path) -> Result<PathBuf, Error> {
        for ext in EXTENSIONS {
            let path = path.join(format!("index.{ext}"));
            if path.is_file() {
                return Ok(path);
            }
        }
        bail!("Failed to find module \"{}\"", path.display());
    }
}

impl ModuleLoader for FsModuleLoader {
    fn resolve(&self, base: Option<&str>, specifier: &str) -> Result<String, Error> {
        // Resolving absolute defined imports.
        if specifier.starts_with('/') {
            let path = Path::new("/").join(specifier.trim_start_matches('/'));
            return self
                .resolve_as_file(&path)
                .or_else(|_| self.resolve_as_directory(&path))
                .and_then(|path| self.clean(path));
        }

        let cwd = Path::new(".");
        let referrer = base.unwrap_or(".");
        let mut base_dir = Path::new(referrer).parent().unwrap_or(cwd);

        if specifier.starts_with("./") || specifier.starts_with("../") {
            let win_target;
            let target = if cfg!(target_os = "windows") {
                #[allow(clippy::manual_strip)]
                let t = if specifier.starts_with("./") {
                    &specifier[2..]
                } else {
                    base_dir = base_dir.parent().unwrap_or(cwd);
                    &specifier[3..]
                };
                win_target = t.replace('/', "\\");
                &*win_target
            } else {
                specifier
            };

            let path = base_dir.join(target);
            return self
                .resolve_as_file(&path)
                .or_else(|_| self.resolve_as_directory(&path))
                .and_then(|path| self.clean(path));
        }

        bail!("Failed to resolve module \"{}\"", specifier);
    }

    fn load(&self, specifier: &str) -> Result<(MediaType, String), Error> {
        let media_type = MediaType::from_specifier(specifier);
        let source = fs::read_to_string(specifier)
            .with_context(|| format!("Failed to load module \"{specifier}\""))?;

        let source = match media_type {
            MediaType::Json => wrap_json(&source),
            _ => source,
        };

        Ok((media_type, source))
    }
}

/// Fetches `http(s)://` specifiers, caching their source on disk keyed by a
/// hash of the URL so repeated runs don't re-download. `--reload` bypasses
/// the cache for a single run.
pub struct UrlModuleLoader {
    pub skip_cache: bool,
}

impl Default for UrlModuleLoader {
    fn default() -> Self {
        UrlModuleLoader { skip_cache: false }
    }
}

impl UrlModuleLoader {
    fn resolve_as_url(&self, base: Option<&str>, specifier: &str) -> Result<Url, Error> {
        if let Some(base) = base {
            if let Ok(base) = Url::parse(base) {
                return Url::options()
                    .base_url(Some(&base))
                    .parse(specifier)
                    .map_err(Error::from);
            }
        }
        Url::from_str(specifier).map_err(Error::from)
    }
}

impl ModuleLoader for UrlModuleLoader {
    fn resolve(&self, base: Option<&str>, specifier: &str) -> Result<String, Error> {
        self.resolve_as_url(base, specifier)
            .map(|url| url.as_str().to_string())
    }

    fn load(&self, specifier: &str) -> Result<(MediaType, String), Error> {
        let media_type = MediaType::from_specifier(specifier);
        let cache_dir = env::current_dir()?.join(".vale_cache");
        fs::create_dir_all(&cache_dir).context("Failed to create module cache directory")?;

        let hash = Sha1::default().digest(specifier.as_bytes()).to_hex();
        let module_path = cache_dir.join(&hash);

        if !self.skip_cache && module_path.is_file() {
            let source = fs::read_to_string(&module_path)?;
            return Ok((media_type, source));
        }

        println!("{} {}", "Downloading".green(), specifier);

        let source = ureq::get(specifier)
            .call()
            .with_context(|| format!("Failed to fetch {specifier}"))?
            .into_string()
            .with_context(|| format!("Failed to read response body for {specifier}"))?;

        fs::write(&module_path, &source)?;

        let source = match media_type {
            MediaType::Json => wrap_json(&source),
            _ => source,
        };

        Ok((media_type, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_is_derived_from_the_specifier_extension() {
        assert_eq!(MediaType::from_specifier("./a.json"), MediaType::Json);
        assert_eq!(MediaType::from_specifier("./a.js"), MediaType::JavaScript);
        assert_eq!(
            MediaType::from_specifier("https://example.com/x.json?v=2"),
            MediaType::Json
        );
        assert_eq!(MediaType::from_specifier("./a.wasm"), MediaType::Wasm);
        assert_eq!(MediaType::from_specifier("./a"), MediaType::Unknown);
    }

    #[test]
    fn json_is_wrapped_as_a_default_export() {
        let wrapped = wrap_json("{\"a\":1}");
        assert!(wrapped.starts_with("export default JSON.parse("));
        assert!(wrapped.contains("\\\"a\\\":1"));
    }

    #[test]
    fn fs_loader_resolves_relative_imports_against_the_referrer_dir() {
        let loader = FsModuleLoader;
        let err = loader.resolve(Some("/tmp/project/main.js"), "./missing.js");
        assert!(err.is_err());
    }
}
