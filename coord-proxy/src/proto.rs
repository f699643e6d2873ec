// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::all)]

tonic::include_proto!("coord.voting.v1");
