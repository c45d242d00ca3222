// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

// Allowed: This is a CLI code generation tool, not server code.
// Using println! for progress output is appropriate here.
#![allow(clippy::disallowed_macros)]

use std::fs;
use std::path::Path;
use ts_rs::TS;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let declarations = vec![
        format!("// orchard-api\nexport {}", orchard_api::MachineId::decl()),
        format!("export {}", orchard_api::UserId::decl()),
        format!("export {}", orchard_api::DiskFormat::decl()),
        format!("export {}", orchard_api::ConnectionProtocol::decl()),
        format!("export {}", orchard_api::AccountRef::decl()),
        format!("export {}", orchard_api::StaticDiskInfo::decl()),
        format!("export {}", orchard_api::DynamicDiskInfo::decl()),
        format!("export {}", orchard_api::ActiveConnection::decl()),
        format!("export {}", orchard_api::MachinePropertiesPayload::decl()),
        format!("export {}", orchard_api::MachineStatePayload::decl()),
        format!("export {}", orchard_api::MachineDisksPayload::decl()),
        format!("export {}", orchard_api::MachineConnectionsPayload::decl()),
        format!("export {}", orchard_api::MachineEventBody::decl()),
        format!("export {}", orchard_api::MessageBody::decl()),
        // The envelope flattens the tagged body next to the message uuid.
        "export type Envelope = { uuid: string } & MessageBody;".to_string(),
    ];

    let output = declarations.join("\n\n");
    let content =
        format!("// This file is auto-generated. Do not edit it manually.\n\n{output}\n");

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|parent| parent.parent())
        .ok_or("Failed to find workspace root from CARGO_MANIFEST_DIR")?;
    let output_path = workspace_root.join("ui/src/types/generated/api-types.ts");

    println!("Writing TypeScript bindings to: {}", output_path.display());

    fs::write(&output_path, content)?;

    println!("TypeScript bindings generated successfully.");

    Ok(())
}
