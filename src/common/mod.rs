// Glimmer compiler common definitions
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
//
// Shared across the frontend and backend: the value/object model, the
// bytecode instruction set, and the map-key hashing rules.
pub mod object;
pub mod opcode;
pub mod hash;
