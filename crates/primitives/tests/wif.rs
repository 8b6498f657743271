use beand_consensus::{chain_params, Network};
use beand_primitives::address::pubkey_to_p2pkh_script;
use beand_primitives::{
    address_to_script_pubkey, script_pubkey_to_address, secret_key_to_wif, wif_to_secret_key,
    AddressError,
};

#[test]
fn wif_roundtrips_mainnet() {
    let prefixes = chain_params(Network::Mainnet).base58;
    let secret = [0x11u8; 32];

    let wif = secret_key_to_wif(&secret, &prefixes, false);
    assert_eq!(
        wif_to_secret_key(&wif, &prefixes).expect("decode"),
        (secret, false)
    );

    let wif = secret_key_to_wif(&secret, &prefixes, true);
    assert_eq!(
        wif_to_secret_key(&wif, &prefixes).expect("decode"),
        (secret, true)
    );
}

#[test]
fn wif_rejects_wrong_network() {
    let main = chain_params(Network::Mainnet).base58;
    let test = chain_params(Network::Testnet).base58;
    let wif = secret_key_to_wif(&[0x33u8; 32], &main, true);
    assert_eq!(
        wif_to_secret_key(&wif, &test),
        Err(AddressError::UnknownPrefix)
    );
}

#[test]
fn address_roundtrips_through_script() {
    let prefixes = chain_params(Network::Mainnet).base58;
    let script = pubkey_to_p2pkh_script(&[0x02; 33]);
    let address = script_pubkey_to_address(&script, &prefixes).expect("p2pkh address");
    assert_eq!(
        address_to_script_pubkey(&address, &prefixes).expect("decode"),
        script
    );

    let mut corrupted = address.into_bytes();
    let last = corrupted.len() - 1;
    corrupted[last] = if corrupted[last] == b'2' { b'3' } else { b'2' };
    let corrupted = String::from_utf8(corrupted).expect("ascii");
    assert!(address_to_script_pubkey(&corrupted, &prefixes).is_err());
}
