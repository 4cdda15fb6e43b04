use crate::core::app::App;
use crate::core::persona::Persona;

pub fn list_coaches(app: &App) {
    let is_premium = app.is_premium();
    println!("Available coaches:\n");

    for persona in app.catalog().iter() {
        println!("{}", describe(persona, is_premium));
    }

    println!("\n💡 Start a conversation with:");
    println!("   coachai chat -c <coach_id>");
    if !is_premium && app.catalog().premium().next().is_some() {
        println!("\n🔒 Locked coaches need Premium: coachai upgrade");
    }
}

fn describe(persona: &Persona, is_premium: bool) -> String {
    let marker = if persona.is_accessible(is_premium) {
        "•"
    } else {
        "🔒"
    };
    let mut line = format!(
        "  {marker} {} {} ({}) - {}",
        persona.avatar, persona.name, persona.id, persona.role
    );
    if persona.is_custom() {
        line.push_str(" [custom]");
    }
    line
}
