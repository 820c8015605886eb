//! `//!` directive parsing and fragment assembly.
//!
//! Directive lines recognized in a shader source:
//!
//! - `//!DESC <text>`: human description.
//! - `//!BIND <name>`: input render target, order preserved.
//! - `//!SAVE <name>`: output render target for the pass.
//! - `//!WIDTH <expr> * <expr>` / `//!HEIGHT <expr> * <expr>`: axis scale of 2.
//!
//! Parsing quirks are intentional and kept for compatibility: the
//! directive payload starts at a fixed offset of 8 characters (so a
//! directive without its trailing space yields an empty payload rather
//! than an error), and any `*` anywhere on a WIDTH/HEIGHT line means
//! exactly "times two"; arbitrary scale expressions are not supported.
//! Non-directive lines form the fragment body, which must define
//! `vec4 hook()`.

/// One parsed pass, before GPU compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPass {
    /// Caller-supplied name, used in diagnostics.
    pub name: String,
    pub desc: String,
    /// Render target this pass writes. Empty when the source has no SAVE.
    pub save_target: String,
    /// Render targets bound as inputs, in directive order.
    pub bind_targets: Vec<String>,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Non-directive source lines.
    pub body: String,
}

fn payload(line: &str) -> String {
    line.get(8..).unwrap_or("").to_string()
}

/// Parse one shader source into a pass description.
pub fn parse_pass(source: &str, name: &str) -> ParsedPass {
    let mut pass = ParsedPass {
        name: name.to_string(),
        desc: String::new(),
        save_target: String::new(),
        bind_targets: Vec::new(),
        scale_x: 1.0,
        scale_y: 1.0,
        body: String::new(),
    };

    for line in source.lines() {
        if line.starts_with("//!DESC") {
            pass.desc = payload(line);
        }
        if line.starts_with("//!BIND") {
            pass.bind_targets.push(payload(line));
        }
        if line.starts_with("//!SAVE") {
            pass.save_target = payload(line);
        }
        if line.starts_with("//!WIDTH") && line.contains('*') {
            pass.scale_x = 2.0;
        }
        if line.starts_with("//!HEIGHT") && line.contains('*') {
            pass.scale_y = 2.0;
        }
        if !line.starts_with("//!") {
            pass.body.push_str(line);
            pass.body.push('\n');
        }
    }

    pass
}

/// Assemble the effective fragment source for a pass.
///
/// A fixed header is prepended, then per bound target a `sampler2D`-style
/// texture `<name>_tex`, a `vec2 <name>_size` and the three access macros
/// `<name>_tex(pos)`, `<name>_texOff(off)` and `<name>_pos`, then the body,
/// then a `main` that writes `fragColor = hook()`. The source is
/// Vulkan-profile GLSL with explicit bindings: the shared sampler sits at
/// binding 0 and bound target j occupies bindings 2j+1 (texture) and
/// 2j+2 (size).
pub fn assemble_fragment(pass: &ParsedPass) -> String {
    let mut fs = String::from(
        "#version 450\n\
         layout(location = 0) in vec2 vTexCoord;\n\
         layout(location = 0) out vec4 fragColor;\n\
         layout(set = 0, binding = 0) uniform sampler chain_sampler;\n",
    );

    for (j, b) in pass.bind_targets.iter().enumerate() {
        let tex_binding = 2 * j + 1;
        let size_binding = 2 * j + 2;
        fs.push_str(&format!(
            "layout(set = 0, binding = {tex_binding}) uniform texture2D {b}_tex;\n"
        ));
        fs.push_str(&format!(
            "layout(set = 0, binding = {size_binding}) uniform {b}_params {{ vec2 {b}_size; }};\n"
        ));
        fs.push_str(&format!(
            "#define {b}_tex(pos) textureLod(sampler2D({b}_tex, chain_sampler), pos, 0.0)\n"
        ));
        fs.push_str(&format!(
            "#define {b}_texOff(off) textureLod(sampler2D({b}_tex, chain_sampler), vTexCoord + off / {b}_size, 0.0)\n"
        ));
        fs.push_str(&format!("#define {b}_pos vTexCoord\n"));
    }

    fs.push_str(&pass.body);
    fs.push_str("\nvoid main() { fragColor = hook(); }\n");
    fs
}

/// Output dimensions after running every pass: the input size times the
/// product of per-pass scales.
pub fn chain_output_size(passes: &[ParsedPass], width: u32, height: u32) -> (u32, u32) {
    let mut w = width as f32;
    let mut h = height as f32;
    for pass in passes {
        w *= pass.scale_x;
        h *= pass.scale_y;
    }
    (w as u32, h as u32)
}
