use serde::Serialize;
use serde_json::{json, Map, Value};

pub const TOOL_CHAT: &str = "chat";
pub const TOOL_NUTRITION_ADVICE: &str = "nutrition-advice";
pub const TOOL_IMAGE_ANALYSIS: &str = "image-nutrition-analysis";
pub const TOOL_SEND_EMAIL: &str = "send-email";
pub const TOOL_SETUP_REQUIRED: &str = "setup-required";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolVisibility {
    Advertised,
    /// Callable by name but left out of `tools/list`.
    Internal,
}

#[derive(Debug, Clone)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    visibility: ToolVisibility,
}

/// Fixed tool set, in the order clients see it.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn for_credentials(has_llm_credential: bool) -> Self {
        let tools = if has_llm_credential {
            vec![
                advertised(
                    TOOL_CHAT,
                    "Conversar con IA especializada en nutrición y salud",
                    &[
                        ("message", "string", "Mensaje para la IA"),
                        ("userProfile", "object", "Perfil del usuario"),
                    ],
                    &["message"],
                ),
                advertised(
                    TOOL_NUTRITION_ADVICE,
                    "Obtener consejos específicos de nutrición",
                    &[
                        ("question", "string", "Pregunta sobre nutrición"),
                        ("userProfile", "object", "Perfil del usuario"),
                    ],
                    &["question"],
                ),
                advertised(
                    TOOL_IMAGE_ANALYSIS,
                    "Analizar imagen de comida para calcular macronutrientes",
                    &[
                        ("imageData", "string", "Datos de la imagen en base64 o data URL"),
                        ("imageName", "string", "Nombre de la imagen"),
                        ("userProfile", "object", "Perfil del usuario"),
                    ],
                    &["imageData"],
                ),
                RegisteredTool {
                    descriptor: descriptor(
                        TOOL_SEND_EMAIL,
                        "Enviar notificación al nutricionista (herramienta interna)",
                        &[
                            ("to", "string", "Email del destinatario"),
                            ("subject", "string", "Asunto del mensaje"),
                            ("message", "string", "Contenido del mensaje"),
                            ("userProfile", "object", "Perfil del usuario"),
                            ("nutritionist", "object", "Información del nutricionista"),
                            ("isValidation", "boolean", "Solicitud de validación de un plan"),
                        ],
                        &["to", "subject", "message"],
                    ),
                    visibility: ToolVisibility::Internal,
                },
            ]
        } else {
            vec![advertised(
                TOOL_SETUP_REQUIRED,
                "Configuración de OpenAI requerida",
                &[("message", "string", "Mensaje informativo")],
                &[],
            )]
        };
        Self { tools }
    }

    pub fn advertised(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|tool| tool.visibility == ToolVisibility::Advertised)
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    /// Looks the name up across every tier, internal tools included.
    pub fn resolve(&self, name: &str) -> Option<&ToolDescriptor> {
        let name = name.trim();
        self.tools
            .iter()
            .find(|tool| tool.descriptor.name == name)
            .map(|tool| &tool.descriptor)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

fn advertised(
    name: &str,
    description: &str,
    properties: &[(&str, &str, &str)],
    required: &[&str],
) -> RegisteredTool {
    RegisteredTool {
        descriptor: descriptor(name, description, properties, required),
        visibility: ToolVisibility::Advertised,
    }
}

fn descriptor(
    name: &str,
    description: &str,
    properties: &[(&str, &str, &str)],
    required: &[&str],
) -> ToolDescriptor {
    let mut schema_properties = Map::new();
    for (property, kind, about) in properties {
        schema_properties.insert(
            (*property).to_owned(),
            json!({ "type": kind, "description": about }),
        );
    }
    ToolDescriptor {
        name: name.to_owned(),
        description: description.to_owned(),
        input_schema: json!({
            "type": "object",
            "properties": schema_properties,
            "required": required,
        }),
    }
}
