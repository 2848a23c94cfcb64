use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn workspace_root(crate_dir: &Path) -> PathBuf {
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("crate directory should be <root>/crates/<name>")
        .to_path_buf()
}

fn take_until_paren_close<'a>(s: &'a str) -> Option<&'a str> {
    let s = s.trim();
    let j = s.find(')')?;
    Some(s[..j].trim())
}

/// STORE_SLICE+1 -> StoreSlice1, LOAD_CONST -> LoadConst.
fn variant_ident(mnemonic: &str) -> String {
    let mut out = String::new();
    for part in mnemonic.split(['_', '+']) {
        let mut chars = part.chars();
        if let Some(c) = chars.next() {
            out.push(c.to_ascii_uppercase());
            out.push_str(&chars.as_str().to_ascii_lowercase());
        }
    }
    out
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let root = workspace_root(&manifest_dir);

    let def_path = root.join("cpython").join("opcodes.def");
    println!("cargo:rerun-if-changed={}", def_path.display());

    let src = fs::read_to_string(&def_path).expect("read cpython/opcodes.def");

    let mut fmts: Vec<String> = Vec::new();
    let mut ops: Vec<(String, u8, String)> = Vec::new();
    let mut cmps: Vec<String> = Vec::new();

    for line in src.lines() {
        let l = line.trim();
        if let Some(rest) = l.strip_prefix("FMT(") {
            let name = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            if !name.is_empty() {
                fmts.push(name.to_string());
            }
            continue;
        }
        if let Some(rest) = l.strip_prefix("CMP(") {
            let tok = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            cmps.push(tok.to_string());
            continue;
        }
        let rest = match l.strip_prefix("DEF(") {
            Some(v) => v,
            None => continue,
        };
        let inner = match take_until_paren_close(rest) {
            Some(v) => v,
            None => continue,
        };
        let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
        if parts.len() != 3 {
            continue;
        }
        let mnemonic = parts[0].to_string();
        let hex = parts[1].strip_prefix("0x").expect("opcode byte in hex");
        let byte = u8::from_str_radix(hex, 16).expect("opcode byte");
        let fmt = parts[2].to_string();
        ops.push((mnemonic, byte, fmt));
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_path = out_dir.join("cpython_tables.rs");

    let mut out = String::new();

    out.push_str("#[allow(non_camel_case_types)]\n");
    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq)]\n");
    out.push_str("pub enum OpFmt {\n");
    for f in &fmts {
        out.push_str(&format!("    {},\n", f.to_ascii_uppercase()));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]\n");
    out.push_str("pub enum Opcode {\n");
    for (mnemonic, _, _) in &ops {
        out.push_str(&format!("    {},\n", variant_ident(mnemonic)));
    }
    out.push_str("}\n\n");

    out.push_str("impl Opcode {\n");

    out.push_str("    pub fn from_byte(byte: u8) -> Option<Opcode> {\n");
    out.push_str("        match byte {\n");
    for (mnemonic, byte, _) in &ops {
        out.push_str(&format!(
            "            0x{:02x} => Some(Opcode::{}),\n",
            byte,
            variant_ident(mnemonic)
        ));
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    out.push_str("    pub fn byte(self) -> u8 {\n");
    out.push_str("        match self {\n");
    for (mnemonic, byte, _) in &ops {
        out.push_str(&format!(
            "            Opcode::{} => 0x{:02x},\n",
            variant_ident(mnemonic),
            byte
        ));
    }
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    out.push_str("    pub fn mnemonic(self) -> &'static str {\n");
    out.push_str("        match self {\n");
    for (mnemonic, _, _) in &ops {
        out.push_str(&format!(
            "            Opcode::{} => \"{}\",\n",
            variant_ident(mnemonic),
            mnemonic
        ));
    }
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    out.push_str("    pub fn fmt(self) -> OpFmt {\n");
    out.push_str("        match self {\n");
    for (mnemonic, _, fmt) in &ops {
        out.push_str(&format!(
            "            Opcode::{} => OpFmt::{},\n",
            variant_ident(mnemonic),
            fmt.to_ascii_uppercase()
        ));
    }
    out.push_str("        }\n");
    out.push_str("    }\n\n");

    out.push_str("    pub fn has_arg(self) -> bool {\n");
    out.push_str("        !matches!(self.fmt(), OpFmt::NONE)\n");
    out.push_str("    }\n");

    out.push_str("}\n\n");

    out.push_str("pub const CMP_OP: &[&str] = &[\n");
    for tok in &cmps {
        out.push_str(&format!("    \"{}\",\n", tok));
    }
    out.push_str("];\n");

    fs::write(out_path, out).expect("write generated cpython tables");
}
