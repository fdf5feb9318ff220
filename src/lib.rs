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

//! A kernel-mode-setting Wayland compositor engine: damage-tracked scene
//! graph, KMS plane attachment, input routing, a privileged launcher, and
//! the window model that shell adapters plug into. The wire protocol and
//! shell request tables live outside the engine and connect through the
//! traits in `protocol`.

pub mod args;
pub mod bindings;
pub mod buffer;
pub mod compositor;
pub mod data_device;
pub mod dmabuf;
pub mod drm;
pub mod error_utils;
pub mod event;
pub mod geometry;
pub mod input;
pub mod launch;
pub mod prelude;
pub mod protocol;
pub mod region;
pub mod render;
pub mod screen;
pub mod server;
pub mod shm;
pub mod surface;
pub mod utils;
pub mod view;
pub mod window;
