// Process-wide cryptographic primitives of the trusted boundary: the page
// codec every host-bound page passes through, and the PRF that labels
// oblivious accesses. Keys are fixed at enclave load and never mutated.

pub mod codec;
pub mod prf;

pub use codec::{page_decryption, page_encryption};
pub use prf::{prf, Token, TOKEN_LEN};
