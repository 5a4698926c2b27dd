use carlink_protocol::{MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("carlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: carlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol_versions: {MIN_PROTOCOL_VERSION}-{MAX_PROTOCOL_VERSION}");
    println!(
        "target: {}",
        option_env!("CARLINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("CARLINK_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("transports: tcp, bluetooth, usb");
    println!(
        "features: session={}, cli=true",
        cfg!(feature = "session")
    );

    Ok(SUCCESS)
}
