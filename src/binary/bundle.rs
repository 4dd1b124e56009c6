//! Best-effort bundle, icon and file-metadata lookups
//!
//! None of these affect binary identity; every failure yields `None`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde_json::Value;

use crate::binary::codesign::run_with_deadline;
use crate::binary::entitlements::parse_plist_dict;
use crate::constants::APP_STORE_RECEIPT;
use crate::models::BundleInfo;

/// Application bundle enclosing an executable, with the pieces derived from it
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedBundle {
    pub info: BundleInfo,
    pub icon: Option<PathBuf>,
    pub has_store_receipt: bool,
}

/// Find the nearest enclosing `*.app` directory that has an Info.plist
pub fn locate_bundle(executable: &Path) -> Option<LocatedBundle> {
    let app_dir = executable.ancestors().skip(1).find(|dir| {
        dir.extension().map(|ext| ext == "app").unwrap_or(false)
            && dir.join("Contents/Info.plist").is_file()
    })?;

    read_bundle(app_dir)
}

/// Read an application bundle's Info.plist
pub fn read_bundle(app_dir: &Path) -> Option<LocatedBundle> {
    let info_plist = plist::Value::from_file(app_dir.join("Contents/Info.plist")).ok()?;
    let dict = info_plist.as_dictionary()?;
    let string_key = |key: &str| {
        dict.get(key)
            .and_then(plist::Value::as_string)
            .map(str::to_string)
    };

    let icon = string_key("CFBundleIconFile").and_then(|icon_file| {
        let mut icon_path = app_dir.join("Contents/Resources").join(icon_file);
        if icon_path.extension().is_none() {
            icon_path.set_extension("icns");
        }
        icon_path.is_file().then_some(icon_path)
    });

    Some(LocatedBundle {
        info: BundleInfo {
            path: app_dir.to_path_buf(),
            identifier: string_key("CFBundleIdentifier"),
            name: string_key("CFBundleName"),
            version: string_key("CFBundleShortVersionString"),
            executable: string_key("CFBundleExecutable"),
        },
        icon,
        has_store_receipt: app_dir.join(APP_STORE_RECEIPT).is_file(),
    })
}

/// Spotlight attributes for a file, via `mdls -plist -`
pub fn spotlight_metadata(path: &Path, deadline: Duration) -> Option<HashMap<String, Value>> {
    let mut command = Command::new("mdls");
    command.args(["-plist", "-"]).arg(path);

    let output = match run_with_deadline(command, deadline) {
        Ok(output) if output.status.success() => output,
        Ok(_) => return None,
        Err(e) => {
            log::debug!("spotlight metadata unavailable for {}: {}", path.display(), e);
            return None;
        }
    };

    parse_plist_dict(&output.stdout)
        .ok()
        .filter(|metadata| !metadata.is_empty())
}
