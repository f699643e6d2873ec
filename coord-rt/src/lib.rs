// SPDX-License-Identifier: Apache-2.0

mod spawn;
pub use spawn::{Cancelled, JoinError, Spawner, Stats, Task};

mod time;
pub use time::{interval, sleep, timeout, Elapsed};
