use std::path::{Path, PathBuf};

/// Collects sky-index files from the given folders. With `index_to_use`
/// set, only series matching that index number are returned; adding
/// `healpix_to_use` narrows the match to one sky patch of the series.
pub fn find_index_files(
    folders: &[PathBuf],
    index_to_use: Option<u32>,
    healpix_to_use: Option<u32>,
) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for folder in folders {
        let Ok(entries) = std::fs::read_dir(folder) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_index_extension(&path) {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let matches = match (index_to_use, healpix_to_use) {
                (None, _) => true,
                (Some(index), None) => name.starts_with(&format!("index-{}", index)),
                (Some(index), Some(healpix)) => {
                    name == format!("index-{}-{:02}", index, healpix)
                }
            };
            if matches {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn is_index_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let e = ext.to_ascii_lowercase();
            e == "fits" || e == "fit"
        })
        .unwrap_or(false)
}

fn push_if_exists(list: &mut Vec<PathBuf>, path: PathBuf) {
    if path.is_dir() {
        list.push(path);
    }
}

/// Well-known index locations for the current platform, filtered to the
/// ones that exist.
pub fn default_index_folders() -> Vec<PathBuf> {
    let mut folders = Vec::new();
    let home = std::env::var_os("HOME").map(PathBuf::from);

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = &home {
            push_if_exists(&mut folders, home.join("Library/Application Support/Astrometry"));
        }
        push_if_exists(&mut folders, PathBuf::from("/usr/local/share/astrometry"));
    }
    #[cfg(target_os = "linux")]
    {
        push_if_exists(&mut folders, PathBuf::from("/usr/share/astrometry"));
        if let Some(home) = &home {
            push_if_exists(&mut folders, home.join(".local/share/kstars/astrometry"));
        }
    }
    #[cfg(windows)]
    {
        if let Some(home) = &home {
            push_if_exists(
                &mut folders,
                home.join("AppData/Local/cygwin_ansvr/usr/share/astrometry/data"),
            );
        }
        push_if_exists(&mut folders, PathBuf::from("C:/cygwin/usr/share/astrometry/data"));
    }

    folders
}
