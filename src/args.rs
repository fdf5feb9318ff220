// Copyright 2026 the welkin authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use ron::Options;
use ron::extensions::Extensions;
use serde::Deserialize;
use serde::Serialize;
use tracing::Level;
use tracing::metadata::ParseLevelError;

use crate::prelude::*;

/// A binary's running configuration: defaults, overridden by the config file,
/// overridden by command-line flags. The flags type is the clap parser; each
/// optional flag that is set replaces the corresponding config field.
pub trait Config: Debug + Default + Serialize + for<'a> Deserialize<'a> {
    fn config_file(&self) -> PathBuf;

    fn print_default_and_exit() -> ! {
        println!(
            "{}",
            ron::ser::to_string_pretty::<Self>(
                &Default::default(),
                ron::ser::PrettyConfig::default()
            )
            .unwrap()
        );
        process::exit(0);
    }

    fn read_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            debug!("config file does not exist at {path:?}");
            return None;
        }

        let config_str = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                error!("config file at {path:?} exists but there was an error reading it: {e}");
                return None;
            },
        };
        match Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .from_str(&config_str)
        {
            Ok(config) => Some(config),
            Err(e) => {
                error!("error parsing config file at {path:?}: {e}");
                None
            },
        }
    }
}

fn fallback_config_parent_dir() -> Result<PathBuf> {
    Ok(Path::join(
        &home::home_dir().ok_or(anyhow!("unable to determine home dir"))?,
        ".config",
    ))
}

pub fn default_config_file_dir() -> PathBuf {
    Path::join(
        &env::var("XDG_CONFIG_HOME")
            .ok()
            .map(Into::into)
            .or(fallback_config_parent_dir().ok())
            .unwrap_or_else(|| "/etc".into()),
        "welkin",
    )
}

pub fn default_config_file(name: &str) -> PathBuf {
    Path::join(&default_config_file_dir(), format!("{name}.ron"))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerializableLevel(pub Level);

impl FromStr for SerializableLevel {
    type Err = ParseLevelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Level::from_str(s)?))
    }
}

impl Serialize for SerializableLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for SerializableLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self(Level::from_str(&s).map_err(serde::de::Error::custom)?))
    }
}

/// Replaces `field` with the flag's value when the flag was given.
pub fn apply<T>(field: &mut T, flag: Option<T>) {
    if let Some(value) = flag {
        *field = value;
    }
}
