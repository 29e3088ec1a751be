use crate::{pairs_for, CoreContext, DecryptParameters, EncryptParameters, SignParameters};
use alloy_primitives::{Address, B256};
use fhevm_instance::instance::{EncryptedInput, FhevmInstance};
use serde_json::{json, Value};
use std::collections::BTreeMap;

async fn encrypt_values(
    instance: &dyn FhevmInstance,
    contract: Address,
    user: Address,
    values: &[u64],
) -> anyhow::Result<EncryptedInput> {
    let mut builder = instance.create_encrypted_input(contract, user);
    for value in values {
        builder.add64(*value)?;
    }
    builder.encrypt().await
}

/// The private half of the key pair stays out of the output.
pub async fn sign_cmd(ctx: &CoreContext, params: &SignParameters) -> anyhow::Result<Value> {
    let signer = params.signer.signer()?;
    let instance = ctx.instance(&params.network.network).await?;
    let authorization = ctx
        .authorizations
        .load_or_sign(instance.as_ref(), &params.contracts, &signer)
        .await?;
    Ok(json!({
        "userAddress": authorization.user_address,
        "contractAddresses": authorization.contract_addresses,
        "publicKey": authorization.public_key,
        "signature": authorization.signature,
        "startTimestamp": authorization.start_timestamp,
        "durationDays": authorization.duration_days,
        "expiresAt": authorization.expires_at(),
    }))
}

pub async fn encrypt_cmd(ctx: &CoreContext, params: &EncryptParameters) -> anyhow::Result<Value> {
    let signer = params.signer.signer()?;
    let instance = ctx.instance(&params.network.network).await?;
    let input =
        encrypt_values(instance.as_ref(), params.contract, signer.address(), &params.values)
            .await?;
    tracing::info!("encrypted {} values for {}", input.handles.len(), params.contract);
    Ok(serde_json::to_value(input)?)
}

pub async fn decrypt_cmd(ctx: &CoreContext, params: &DecryptParameters) -> anyhow::Result<Value> {
    let signer = params.signer.signer()?;
    let instance = ctx.instance(&params.network.network).await?;

    let mut handles: Vec<B256> = params.handles.clone();
    if !params.values.is_empty() {
        let input = encrypt_values(
            instance.as_ref(),
            params.contract,
            signer.address(),
            &params.values,
        )
        .await?;
        handles.extend(input.handles);
    }
    if handles.is_empty() {
        anyhow::bail!("nothing to decrypt: pass --handle or --value");
    }

    let results = ctx
        .authorizations
        .user_decrypt(instance.as_ref(), &pairs_for(params.contract, &handles), &signer)
        .await?;
    let ordered: BTreeMap<String, String> = results
        .into_iter()
        .map(|(handle, clear)| (handle.to_string(), clear.to_string()))
        .collect();
    Ok(serde_json::to_value(ordered)?)
}
