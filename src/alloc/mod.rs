/*
 * Dynamic Allocation
 *
 * Backs dynamic thread-stack and IPC-object creation (`DYNAMIC_ALLOC_ENABLE`
 * in `config.rs`). The allocator itself lives in [`bytepool`]; this module
 * just exposes it and is the natural place a board would register
 * additional pools beyond [`bytepool::default_pool`] if it needed to.
 */

pub mod bytepool;
