// Copyright 2025 coScene
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

// Store module
//
// Composable delivery units behind one async trait:
// - terminal stores: file, forward
// - wrappers: buffer (primary/secondary failover), multi (fan-out), bucket (sharding)
// - null, which discards everything

pub mod backend;
pub mod bucket;
pub mod buffer;
pub mod factory;
pub mod file;
pub mod forward;
pub mod multi;
pub mod null;

pub use backend::Store;
pub use bucket::BucketStore;
pub use buffer::BufferStore;
pub use factory::StoreFactory;
pub use file::FileStore;
pub use forward::ForwardStore;
pub use multi::MultiStore;
pub use null::NullStore;
