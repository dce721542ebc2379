//! End to end ethereum tests.
//!
//! Each case deploys the original and the optimized payload on revm and checks that both
//! runtimes answer the same calls the same way.

mod deploy;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use revm::context::TxEnv;
use revm::context::result::{ExecutionResult, Output};
use revm::database::InMemoryDB;
use revm::primitives::{Address, Bytes, TxKind, U256};
use revm::{Context, DatabaseCommit, ExecuteEvm, MainBuilder, MainContext};

const DEPLOYER: Address = Address::new([0x42; 20]);

/// Single-account chain: deploys payloads and calls them from [`DEPLOYER`].
pub struct Chain {
    db: InMemoryDB,
    nonce: u64,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            db: InMemoryDB::default(),
            nonce: 0,
        }
    }

    fn execute(&mut self, kind: TxKind, data: Vec<u8>) -> Result<ExecutionResult> {
        let mut evm = Context::mainnet()
            .with_db(std::mem::take(&mut self.db))
            .build_mainnet();
        let tx = TxEnv {
            caller: DEPLOYER,
            gas_limit: 10_000_000,
            kind,
            data: Bytes::from(data),
            value: U256::ZERO,
            nonce: self.nonce,
            ..Default::default()
        };
        let result = evm.transact(tx).map_err(|e| eyre!("transaction failed: {e:?}"))?;
        evm.db_mut().commit(result.state);
        self.db = std::mem::take(evm.db_mut());
        self.nonce += 1;
        Ok(result.result)
    }

    /// Deploys `payload`, returning the address and the installed runtime.
    pub fn deploy(&mut self, payload: Vec<u8>) -> Result<(Address, Bytes)> {
        match self.execute(TxKind::Create, payload)? {
            ExecutionResult::Success {
                output: Output::Create(runtime, Some(address)),
                ..
            } => Ok((address, runtime)),
            other => Err(eyre!("deployment failed: {other:?}")),
        }
    }

    /// Calls `address`; a revert or halt is returned as `Err`.
    pub fn call(&mut self, address: Address, calldata: Vec<u8>) -> Result<Bytes> {
        match self.execute(TxKind::Call(address), calldata)? {
            ExecutionResult::Success {
                output: Output::Call(data),
                ..
            } => Ok(data),
            other => Err(eyre!("call failed: {other:?}")),
        }
    }
}

/// Calldata holding one big-endian word.
pub fn word(value: u64) -> Vec<u8> {
    U256::from(value).to_be_bytes::<32>().to_vec()
}
