mod hash;

pub mod error;
pub mod secp256k1;

pub use error::CryptoError;
pub use hash::*;
pub use secp256k1::{
    RecoverableSignature, Secp256k1KeyPair, Secp256k1PublicKey, Secp256k1SecretKey,
    WrappedSecp256k1Secret,
};
